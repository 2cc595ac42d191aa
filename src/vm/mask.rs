//! Per-vertex execution mask and the loop-frame stack that gives masked
//! multi-level `break`/`continue` their semantics, implemented as mask
//! operations rather than non-local control flow.

#[derive(Debug, Clone)]
pub struct Mask {
    bits: Vec<bool>,
}

impl Mask {
    pub fn all_active(count: usize) -> Self {
        Mask {
            bits: vec![true; count],
        }
    }

    pub fn none_active(count: usize) -> Self {
        Mask {
            bits: vec![false; count],
        }
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Mask { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty_mask(&self) -> bool {
        !self.bits.iter().any(|b| *b)
    }

    pub fn get(&self, i: usize) -> bool {
        self.bits[i]
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    pub fn and(&self, other: &Mask) -> Mask {
        Mask {
            bits: self
                .bits
                .iter()
                .zip(other.bits.iter())
                .map(|(a, b)| *a && *b)
                .collect(),
        }
    }

    pub fn and_not(&self, other: &Mask) -> Mask {
        Mask {
            bits: self
                .bits
                .iter()
                .zip(other.bits.iter())
                .map(|(a, b)| *a && !*b)
                .collect(),
        }
    }

    pub fn or_in_place(&mut self, other: &Mask) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a = *a || *b;
        }
    }

    /// Clears bits present in `other` from `self` (used to mask broken-out
    /// vertices off the enclosing execution mask).
    pub fn clear_where(&mut self, other: &Mask) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            if *b {
                *a = false;
            }
        }
    }
}

/// One loop's bookkeeping while the VM is inside a varying (masked) loop.
/// The loop stack's depth equals the lexical nesting depth of masked loop
/// constructs currently being executed.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub entry_mask: Mask,
    pub break_mask: Mask,
    pub continue_mask: Mask,
    /// `mask_stack.len()` at the moment this frame's per-iteration mask was
    /// pushed. `break`/`continue` need this to know how many enclosing
    /// `mask_stack` entries (pushed by lexical `if`s inside the loop body)
    /// must also have the affected vertices cleared from them, since those
    /// entries will otherwise reintroduce the vertex once a later `PopMask`
    /// unwinds back down to this depth.
    pub mask_stack_depth: usize,
}

impl LoopFrame {
    pub fn new(entry_mask: Mask, mask_stack_depth: usize) -> Self {
        let count = entry_mask.len();
        LoopFrame {
            entry_mask,
            break_mask: Mask::none_active(count),
            continue_mask: Mask::none_active(count),
            mask_stack_depth,
        }
    }

    /// This iteration's active mask: entry ∧ ¬break ∧ ¬continue.
    pub fn active_mask(&self) -> Mask {
        self.entry_mask.and_not(&self.break_mask).and_not(&self.continue_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn break_clears_vertices_from_the_active_mask() {
        let mut frame = LoopFrame::new(Mask::all_active(4), 0);
        let breaking = Mask::from_bits(vec![true, false, true, false]);
        frame.break_mask.or_in_place(&breaking);
        let active = frame.active_mask();
        assert_eq!(active.bits(), &[false, true, false, true]);
    }

    #[test]
    fn continue_only_masks_the_current_iteration() {
        let mut frame = LoopFrame::new(Mask::all_active(4), 0);
        frame
            .continue_mask
            .or_in_place(&Mask::from_bits(vec![false, true, false, false]));
        assert_eq!(frame.active_mask().bits(), &[true, false, true, true]);
        frame.continue_mask = Mask::none_active(4);
        assert_eq!(frame.active_mask().bits(), &[true, true, true, true]);
    }

    proptest! {
        #[test]
        fn and_not_never_reactivates_a_bit_cleared_by_other(
            a in prop::collection::vec(any::<bool>(), 1..16),
            b in prop::collection::vec(any::<bool>(), 1..16),
        ) {
            let len = a.len().min(b.len());
            let mask_a = Mask::from_bits(a[..len].to_vec());
            let mask_b = Mask::from_bits(b[..len].to_vec());
            let result = mask_a.and_not(&mask_b);
            for i in 0..len {
                if mask_b.get(i) {
                    prop_assert!(!result.get(i));
                } else {
                    prop_assert_eq!(result.get(i), mask_a.get(i));
                }
            }
        }

        #[test]
        fn clear_where_is_idempotent_with_or_in_place(
            bits in prop::collection::vec(any::<bool>(), 1..16),
            clear in prop::collection::vec(any::<bool>(), 1..16),
        ) {
            let len = bits.len().min(clear.len());
            let mut mask = Mask::from_bits(bits[..len].to_vec());
            let clear_mask = Mask::from_bits(clear[..len].to_vec());
            mask.clear_where(&clear_mask);
            for i in 0..len {
                if clear_mask.get(i) {
                    prop_assert!(!mask.get(i));
                }
            }
            // re-ORing the cleared bits back in then clearing again is a no-op
            mask.or_in_place(&clear_mask);
            mask.clear_where(&clear_mask);
            for i in 0..len {
                if clear_mask.get(i) {
                    prop_assert!(!mask.get(i));
                }
            }
        }
    }
}
