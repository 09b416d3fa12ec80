use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use std::path::Path;

use terrain_merge::pipeline::{self, SourceSpec, ZoomSelection};
use terrain_merge::{CellId, Encoding, MergeError, NodataPolicy, Resampling, RunConfig, RunContext};

#[pymodule]
#[pyo3(name = "terrain_merge")]
fn python_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyMergeStats>()?;
    m.add_function(wrap_pyfunction!(elevation_to_rgb, m)?)?;
    m.add_function(wrap_pyfunction!(rgb_to_elevation, m)?)?;
    m.add_function(wrap_pyfunction!(merge_pyramids, m)?)?;
    m.add_function(wrap_pyfunction!(export_hgt, m)?)?;
    m.add_function(wrap_pyfunction!(hgt_filename, m)?)?;
    Ok(())
}

fn to_py_err(e: MergeError) -> PyErr {
    match e {
        MergeError::Io(_) | MergeError::Sqlite(_) | MergeError::MissingInput(_) => {
            PyIOError::new_err(e.to_string())
        }
        _ => PyValueError::new_err(e.to_string()),
    }
}

fn parse_encoding(name: &str, interval: f64, base_val: f64) -> PyResult<Encoding> {
    match name.parse::<Encoding>().map_err(to_py_err)? {
        Encoding::Mapbox { .. } => Encoding::mapbox_with(interval, base_val).map_err(to_py_err),
        Encoding::Terrarium => Ok(Encoding::Terrarium),
    }
}

fn run_context(
    encoding: Encoding,
    resampling: &str,
    threads: Option<usize>,
) -> PyResult<RunContext> {
    let config = RunConfig {
        encoding,
        nodata: NodataPolicy::for_encoding(&encoding),
        resampling: resampling.parse::<Resampling>().map_err(to_py_err)?,
        threads,
    };
    RunContext::new(config).map_err(to_py_err)
}

#[pyclass(name = "MergeStats")]
#[derive(Clone)]
pub struct PyMergeStats {
    #[pyo3(get)]
    pub zooms: Vec<u8>,
    #[pyo3(get)]
    pub tiles_written: usize,
    #[pyo3(get)]
    pub tiles_empty: usize,
    #[pyo3(get)]
    pub tiles_failed: usize,
}

#[pymethods]
impl PyMergeStats {
    fn __repr__(&self) -> String {
        format!(
            "MergeStats(zooms={:?}, tiles_written={}, tiles_empty={}, tiles_failed={})",
            self.zooms, self.tiles_written, self.tiles_empty, self.tiles_failed
        )
    }
}

#[pyfunction]
#[pyo3(signature = (elevation, encoding="mapbox", interval=0.1, base_val=-10000.0))]
pub fn elevation_to_rgb(
    elevation: f32,
    encoding: &str,
    interval: f64,
    base_val: f64,
) -> PyResult<(u8, u8, u8)> {
    Ok(parse_encoding(encoding, interval, base_val)?.encode(elevation))
}

#[pyfunction]
#[pyo3(signature = (r, g, b, encoding="mapbox", interval=0.1, base_val=-10000.0))]
pub fn rgb_to_elevation(
    r: u8,
    g: u8,
    b: u8,
    encoding: &str,
    interval: f64,
    base_val: f64,
) -> PyResult<f32> {
    Ok(parse_encoding(encoding, interval, base_val)?.decode(r, g, b))
}

#[pyfunction]
#[allow(clippy::too_many_arguments)]
#[pyo3(signature = (primary, secondary, output, zoom=None, encoding="mapbox", resampling="bilinear", threads=None))]
pub fn merge_pyramids(
    py: Python<'_>,
    primary: &str,
    secondary: &str,
    output: &str,
    zoom: Option<u8>,
    encoding: &str,
    resampling: &str,
    threads: Option<usize>,
) -> PyResult<PyMergeStats> {
    let encoding = parse_encoding(encoding, 0.1, -10000.0)?;
    let ctx = run_context(encoding, resampling, threads)?;
    let zooms = zoom.map_or(ZoomSelection::All, ZoomSelection::Single);

    let stats = py
        .allow_threads(|| {
            pipeline::merge_pyramids(
                &ctx,
                &SourceSpec::new(primary, encoding),
                &SourceSpec::new(secondary, encoding),
                Path::new(output),
                zooms,
            )
        })
        .map_err(to_py_err)?;

    Ok(PyMergeStats {
        zooms: stats.zooms,
        tiles_written: stats.tiles_written,
        tiles_empty: stats.tiles_empty,
        tiles_failed: stats.tiles_failed,
    })
}

/// Returns the paths of the HGT files written.
#[pyfunction]
#[allow(clippy::too_many_arguments)]
#[pyo3(signature = (primary, output_dir, zoom=12, secondary=None, encoding="mapbox", resampling="bilinear", threads=None))]
pub fn export_hgt(
    py: Python<'_>,
    primary: &str,
    output_dir: &str,
    zoom: u8,
    secondary: Option<&str>,
    encoding: &str,
    resampling: &str,
    threads: Option<usize>,
) -> PyResult<Vec<String>> {
    let encoding = parse_encoding(encoding, 0.1, -10000.0)?;
    let ctx = run_context(encoding, resampling, threads)?;
    let secondary = secondary.map(|path| SourceSpec::new(path, encoding));

    let stats = py
        .allow_threads(|| {
            pipeline::export_hgt(
                &ctx,
                &SourceSpec::new(primary, encoding),
                secondary.as_ref(),
                Path::new(output_dir),
                zoom,
            )
        })
        .map_err(to_py_err)?;

    Ok(stats
        .written
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect())
}

#[pyfunction]
pub fn hgt_filename(lat: i32, lon: i32) -> String {
    terrain_merge::hgt_filename(CellId::new(lat, lon))
}
