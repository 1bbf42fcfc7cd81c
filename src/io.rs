use std::fmt::Display;

use fitrs::{Fits, FitsData, Hdu, HeaderValue};
use ndarray::Array2;

use crate::geom::Vec2D;
use crate::image::{MaskPixel, MaskedImage};
use crate::{DiffimError, Result};

fn axis_length(hdu: &Hdu, key: &str, filename: &str) -> Result<usize> {
    match hdu.value(key) {
        Some(HeaderValue::IntegerNumber(x)) if *x > 0 => Ok(*x as usize),
        _ => Err(DiffimError::InvalidFITS(format!("invalid {} in {}", key, filename))),
    }
}

/// read a 2D hdu into a (rows, cols) array
fn read_plane(hdu: &Hdu, filename: &str) -> Result<Array2<f64>> {
    match hdu.value("NAXIS") {
        Some(HeaderValue::IntegerNumber(2)) => (),
        _ => {
            return Err(DiffimError::InvalidFITS(format!(
                "expected NAXIS==2 in {}",
                filename
            )))
        }
    };
    let rows = axis_length(hdu, "NAXIS2", filename)?;
    let cols = axis_length(hdu, "NAXIS1", filename)?;
    let data: Vec<f64> = match hdu.read_data() {
        FitsData::IntegersI32(array) => array.data.iter().flatten().map(|x| *x as f64).collect(),
        FitsData::IntegersU32(array) => array.data.iter().flatten().map(|x| *x as f64).collect(),
        FitsData::FloatingPoint32(array) => array.data.iter().map(|x| *x as f64).collect(),
        FitsData::FloatingPoint64(array) => array.data,
        FitsData::Characters(array) => array.data.iter().map(|x| *x as u8 as f64).collect(),
    };
    Array2::from_shape_vec((rows, cols), data).map_err(|e| {
        DiffimError::InvalidFITS(format!("{} has inconsistent data: {}", filename, e))
    })
}

/// Load a masked image from a fits file.
///
/// The primary hdu holds the image. If the file carries two extensions they are
/// read as the mask and the variance; otherwise the mask is clear and the
/// variance is taken from the image itself, floored at 1.
pub fn read_masked_image(filename: &str) -> Result<MaskedImage<f32>> {
    let fits = Fits::open(filename)?;
    let primary = fits
        .get(0)
        .ok_or_else(|| DiffimError::InvalidFITS(format!("no primary hdu in {}", filename)))?;
    let image = read_plane(&primary, filename)?;

    let (mask, variance) = match (fits.get(1), fits.get(2)) {
        (Some(mask_hdu), Some(var_hdu)) => {
            let mask = read_plane(&mask_hdu, filename)?.mapv(|m| m as MaskPixel);
            let variance = read_plane(&var_hdu, filename)?;
            (mask, variance)
        }
        _ => (
            Array2::zeros(image.dim()),
            image.mapv(|v| v.abs().max(1.0)),
        ),
    };
    MaskedImage::from_arrays(
        image.mapv(|v| v as f32),
        variance.mapv(|v| v as f32),
        mask,
    )
}

/// Save one plane to a fits file; non-finite pixels are written as NaN.
pub fn write_plane(filename: &str, plane: &Array2<f32>) -> Result<()> {
    let (rows, cols) = plane.dim();
    let data: Vec<f64> = plane.iter().map(|v| *v as f64).collect();
    let primary_hdu = Hdu::new(&[cols, rows], data);
    Fits::create(filename, primary_hdu)?;
    Ok(())
}

/// coordinate struct for interfacing with coordinate files
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinate {
    pub pos: Vec2D,
}

impl TryFrom<&str> for Coordinate {
    type Error = DiffimError;

    /// parse "x,y" into a coordinate
    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        let mut split = s.split(',').map(str::trim);
        let mut ordinate = |name: &str| -> Result<f64> {
            let a = split
                .next()
                .ok_or_else(|| DiffimError::Coordinate(format!("missing {} ordinate", name)))?;
            a.parse::<f64>().map_err(|_| {
                DiffimError::Coordinate(format!("failed to parse {}-ordinate: {}", name, a))
            })
        };
        let x = ordinate("x")?;
        let y = ordinate("y")?;
        Ok(Self { pos: Vec2D { x, y } })
    }
}

impl Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.pos.x, self.pos.y)
    }
}

/// Read candidate positions, one "x,y" per line; blank lines and lines
/// starting with '#' are skipped.
pub fn read_coordinates(filename: &str) -> Result<Vec<Vec2D>> {
    std::fs::read_to_string(filename)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Coordinate::try_from(line).map(|c| c.pos))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coordinate() {
        let c = Coordinate::try_from("12.5, -3").unwrap();
        assert_eq!(c.pos, Vec2D { x: 12.5, y: -3.0 });
        assert_eq!(c.to_string(), "12.5,-3");
        assert!(matches!(
            Coordinate::try_from("12.5"),
            Err(DiffimError::Coordinate(_))
        ));
        assert!(matches!(
            Coordinate::try_from("a,1"),
            Err(DiffimError::Coordinate(_))
        ));
    }

    #[test]
    fn test_read_coordinates_file() {
        let path = std::env::temp_dir().join("diffim_coords_test.txt");
        std::fs::write(&path, "# x,y\n10,20\n\n 30.5 , 40\n").unwrap();
        let coords = read_coordinates(path.to_str().unwrap()).unwrap();
        assert_eq!(
            coords,
            vec![Vec2D { x: 10.0, y: 20.0 }, Vec2D { x: 30.5, y: 40.0 }]
        );
    }
}
