//! End-to-end `break`/`continue` scenarios over a 2x2 grid with
//! `x = [1,0,1,0]`, `y = [0,0,0,0]`: single-level, leveled, nested, and
//! out-of-range `break`/`continue` inside `for` and `while` loops.

use reyes_shading_core::error::RenderError;
use reyes_shading_core::grid::Grid;
use reyes_shading_core::shader::Shader;
use reyes_shading_core::symbol::SymbolTable;
use reyes_shading_core::value::ValueType;
use reyes_shading_core::vm::machine::VirtualMachine;

fn symbol_table() -> SymbolTable {
    let mut table = SymbolTable::new();
    table
        .add_symbols()
        .var("x", ValueType::Float, reyes_shading_core::value::ValueStorage::Varying)
        .var("y", ValueType::Float, reyes_shading_core::value::ValueStorage::Varying);
    table
}

fn grid_with_xy() -> Grid {
    let mut grid = Grid::new();
    grid.resize(2, 2);
    grid.add_value_with_storage("x", ValueType::Float, reyes_shading_core::value::ValueStorage::Varying)
        .unwrap()
        .float_values_mut()
        .unwrap()
        .copy_from_slice(&[1.0, 0.0, 1.0, 0.0]);
    grid.add_value_with_storage("y", ValueType::Float, reyes_shading_core::value::ValueStorage::Varying).unwrap();
    grid
}

fn shade(source: &str) -> Result<Grid, RenderError> {
    let table = symbol_table();
    let shader = Shader::compile("t", source, &table)?;
    let mut grid = grid_with_xy();
    let mut vm = VirtualMachine::new(shader.compiled(), &mut grid);
    vm.bind_defaults()?;
    vm.shade()?;
    Ok(grid)
}

fn ys(grid: &Grid) -> Vec<f32> {
    grid.get("y").unwrap().float_values().unwrap().to_vec()
}

#[test]
fn break_statement_in_for_loop() {
    let grid = shade(
        "surface break_statement_in_for_loop() { \n\
         \x20  uniform float i; \n\
         \x20  for ( i = 0; i < 4; i += 1 ) { \n\
         \x20      y += x; \n\
         \x20      break; \n\
         \x20  } \n\
         }",
    )
    .unwrap();
    assert_eq!(ys(&grid), vec![1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn break_statement_in_for_loop_with_level() {
    let grid = shade(
        "surface break_statement_in_for_loop_with_level() { \n\
         \x20  uniform float i; \n\
         \x20  for ( i = 0; i < 4; i += 1 ) { \n\
         \x20      y += x; \n\
         \x20      break 1; \n\
         \x20  } \n\
         }",
    )
    .unwrap();
    assert_eq!(ys(&grid), vec![1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn break_statement_in_for_loop_with_out_of_range_level() {
    let table = symbol_table();
    let source = "surface break_statement_in_for_loop_with_out_of_range_level() { \n\
                  \x20  uniform float i; \n\
                  \x20  for ( i = 0; i < 4; i += 1 ) { \n\
                  \x20      break 2; \n\
                  \x20  } \n\
                  }";
    let err = Shader::compile("t", source, &table).unwrap_err();
    match err {
        RenderError::CodeGenerationFailed { line, message } => {
            assert_eq!(line, 4);
            assert_eq!(message, "Break to a level outside of a loop");
        }
        other => panic!("expected CodeGenerationFailed, got {other:?}"),
    }
}

#[test]
fn break_statement_in_while_loop() {
    let grid = shade(
        "surface break_statement_in_while_loop() { \n\
         \x20  uniform float i = 0; \n\
         \x20  while ( i < 4 ) { \n\
         \x20      y += x; \n\
         \x20      i += 1; \n\
         \x20      break; \n\
         \x20  } \n\
         }",
    )
    .unwrap();
    assert_eq!(ys(&grid), vec![1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn break_statement_in_while_loop_with_out_of_range_level() {
    let table = symbol_table();
    let source = "surface break_statement_in_while_loop_with_out_of_range_level() { \n\
                  \x20  uniform float i = 0; \n\
                  \x20  while ( i < 4 ) { \n\
                  \x20      break 2; \n\
                  \x20      i += 1; \n\
                  \x20  } \n\
                  }";
    let err = Shader::compile("t", source, &table).unwrap_err();
    match err {
        RenderError::CodeGenerationFailed { line, message } => {
            assert_eq!(line, 4);
            assert_eq!(message, "Break to a level outside of a loop");
        }
        other => panic!("expected CodeGenerationFailed, got {other:?}"),
    }
}

#[test]
fn break_out_of_first_level_of_nested_for_loop() {
    let grid = shade(
        "surface break_out_of_first_level_of_nested_for_loop() { \n\
         \x20  uniform float i, j; \n\
         \x20  for ( j = 0; j < 4; j += 1 ) { \n\
         \x20      for ( i = 0; i < 4; i += 1 ) { \n\
         \x20          y += x; \n\
         \x20          break 1; \n\
         \x20      } \n\
         \x20  } \n\
         }",
    )
    .unwrap();
    assert_eq!(ys(&grid), vec![4.0, 0.0, 4.0, 0.0]);
}

#[test]
fn break_out_of_second_level_of_nested_for_loop() {
    let grid = shade(
        "surface break_out_of_second_level_of_nested_for_loop() { \n\
         \x20  uniform float i, j; \n\
         \x20  for ( j = 0; j < 4; j += 1 ) { \n\
         \x20      for ( i = 0; i < 4; i += 1 ) { \n\
         \x20          y += x; \n\
         \x20          break 2; \n\
         \x20      } \n\
         \x20  } \n\
         }",
    )
    .unwrap();
    assert_eq!(ys(&grid), vec![1.0, 0.0, 1.0, 0.0]);
}

#[test]
fn break_statement_outside_of_loop() {
    let table = symbol_table();
    let source = "surface break_statement_outside_of_loop() { \n\
                  \x20  break; \n\
                  }";
    let err = Shader::compile("t", source, &table).unwrap_err();
    match err {
        RenderError::CodeGenerationFailed { line, message } => {
            assert_eq!(line, 2);
            assert_eq!(message, "Break outside of a loop");
        }
        other => panic!("expected CodeGenerationFailed, got {other:?}"),
    }
}
