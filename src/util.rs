use crate::prelude::*;
use npyz::WriterBuilder;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Obtain integrals (in row-major, same to PySCF but reverse of libcint).
///
/// # Usage
///
/// ```norun
/// let ovlp = intor_row_major(&cint_data, "int1e_ovlp");
/// ```
pub fn intor_row_major(cint_data: &CInt, intor: &str) -> Tsr {
    let device = DeviceTsr::default();
    let (out, shape) = cint_data.integrate_row_major(intor, None, None).into();
    rt::asarray((out, shape.c(), &device))
}

/// Write a row-major `.npy` array of doubles.
pub fn write_npy(path: &Path, data: &[f64], shape: &[usize]) -> Result<()> {
    ensure!(data.len() == shape.iter().product::<usize>(), "{} values do not fill shape {shape:?}", data.len());
    let file = File::create(path).with_context(|| format!("Error writing {}", path.display()))?;
    let shape = shape.iter().map(|&n| n as u64).collect::<Vec<u64>>();
    let mut writer = npyz::WriteOptions::new().default_dtype().shape(&shape).writer(BufWriter::new(file)).begin_nd()?;
    writer.extend(data.iter().copied())?;
    writer.finish()?;
    Ok(())
}

/// Read a row-major `.npy` array of doubles, returning its data and shape.
pub fn read_npy(path: &Path) -> Result<(Vec<f64>, Vec<usize>)> {
    let file = File::open(path).with_context(|| format!("Error reading {}", path.display()))?;
    let npy = npyz::NpyFile::new(BufReader::new(file)).with_context(|| format!("Error reading {}", path.display()))?;
    ensure!(npy.order() == npyz::Order::C, "{} is not stored in row-major order", path.display());
    let shape = npy.shape().iter().map(|&n| n as usize).collect::<Vec<usize>>();
    let data = npy.into_vec::<f64>().with_context(|| format!("Error reading {}", path.display()))?;
    Ok((data, shape))
}

pub fn tensor_from_npy(path: &Path) -> Result<Tsr> {
    let device = DeviceTsr::default();
    let (data, shape) = read_npy(path)?;
    Ok(rt::asarray((data, shape.c(), &device)))
}

pub fn tensor_to_npy(path: &Path, tsr: &Tsr) -> Result<()> {
    let data = tsr.reshape(-1).to_vec();
    write_npy(path, &data, tsr.shape())
}
