//! Python bindings, built with the `python` feature.

use pyo3::prelude::*;

use crate::cli::{load_or_create_config, run, Args};
use crate::fitter::PsfMatch;
use crate::io::read_coordinates;

#[pymodule]
fn diffim(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(cli_diff, m)?)?;
    m.add_function(wrap_pyfunction!(get_coordinates, m)?)?;
    m.add_function(wrap_pyfunction!(basis_size, m)?)?;
    Ok(())
}

// same behaviour as the command line tool

#[pyfunction]
#[pyo3(signature = (template, pattern, coordinates, config="diffim.yaml", prefix="diff_"))]
fn cli_diff(
    template: &str,
    pattern: &str,
    coordinates: &str,
    config: &str,
    prefix: &str,
) -> PyResult<()> {
    let args = Args {
        template: template.to_string(),
        pattern: pattern.to_string(),
        coordinates: coordinates.to_string(),
        config: config.to_string(),
        prefix: prefix.to_string(),
        verbose: 0,
    };
    run(&args)?;
    Ok(())
}

/// candidate positions as (x, y) tuples
#[pyfunction]
fn get_coordinates(filename: &str) -> PyResult<Vec<(f64, f64)>> {
    Ok(read_coordinates(filename)?
        .into_iter()
        .map(|p| (p.x, p.y))
        .collect())
}

/// number of basis kernels the configuration produces
#[pyfunction]
#[pyo3(signature = (config="diffim.yaml"))]
fn basis_size(config: &str) -> PyResult<usize> {
    let matcher = PsfMatch::new(load_or_create_config(config)?)?;
    Ok(matcher.basis().len())
}
