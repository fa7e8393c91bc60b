// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

//! On-disk table: `DLUT`, u32 version, u32 header length, bincode header, zlib'd f32 coefficients.
//! All integers and floats are little-endian.

use std::io::{ Read, Write };
use std::path::Path;
use chrono::NaiveDate;
use nalgebra::Matrix4;
use serde::{ Serialize, Deserialize };

use crate::calibration::{ BoundingBox, CalibrationError, CalibrationVector, Intrinsics };
use crate::lookup_table::{ GenerationStyle, LookUpTable, PIXEL_STRIDE };

const MAGIC: &[u8; 4] = b"DLUT";
const VERSION: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum TableFileError {
    #[error("IO error: {0:?}")]                                    Io(#[from] std::io::Error),
    #[error("Not a table file")]                                   BadMagic,
    #[error("Unsupported table file version {0}")]                 UnsupportedVersion(u32),
    #[error("Invalid header: {0}")]                                Header(#[from] bincode::Error),
    #[error("Invalid calibration in header: {0}")]                 Metadata(#[from] CalibrationError),
    #[error("File is truncated")]                                  Truncated,
    #[error("Expected {expected} coefficients, found {found}")]    LengthMismatch { expected: usize, found: usize },
    #[error("Table size {width}x{height} is out of range")]         BadDimensions { width: usize, height: usize },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct TableHeader {
    width: usize,
    height: usize,
    make: String,
    model: String,
    style: GenerationStyle,
    as_of_date: Option<NaiveDate>,
    intrinsics: [f64; 12],
    transform: [f64; 16], // row-major
    bounding_box: [f64; 6],
    scale: f64,
    z_range: (f64, f64),
}

impl TableHeader {
    fn of(t: &LookUpTable) -> Self {
        let mut transform = [0.0; 16];
        for r in 0..4 {
            for c in 0..4 {
                transform[r * 4 + c] = t.transform[(r, c)];
            }
        }
        Self {
            width: t.width,
            height: t.height,
            make: t.make.clone(),
            model: t.model.clone(),
            style: t.style,
            as_of_date: t.as_of_date,
            intrinsics: t.intrinsics.to_slots(),
            transform,
            bounding_box: t.bounding_box.to_slots(),
            scale: t.scale,
            z_range: t.z_range,
        }
    }

    fn vector(&self) -> Result<CalibrationVector, CalibrationError> {
        CalibrationVector::from_parts(
            &Intrinsics::from_slots(&self.intrinsics),
            &Matrix4::from_row_slice(&self.transform),
            &BoundingBox::from_slots(&self.bounding_box),
            self.scale,
            self.z_range
        )
    }
}

pub fn save(table: &LookUpTable, path: impl AsRef<Path>) -> Result<(), TableFileError> {
    let _time = std::time::Instant::now();
    let header = bincode::serialize(&TableHeader::of(table))?;

    let mut e = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    e.write_all(&le_bytes(table.coefficients()))?;
    let compressed = e.finish()?;

    let mut out = std::io::BufWriter::new(std::fs::File::create(path.as_ref())?);
    out.write_all(MAGIC)?;
    out.write_all(&VERSION.to_le_bytes())?;
    out.write_all(&(header.len() as u32).to_le_bytes())?;
    out.write_all(&header)?;
    out.write_all(&compressed)?;
    out.flush()?;

    ::log::info!("Saved {} {} {}x{} table to {} in {:.3}ms", table.make, table.model, table.width, table.height, path.as_ref().display(), _time.elapsed().as_micros() as f64 / 1000.0);
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<LookUpTable, TableFileError> {
    let _time = std::time::Instant::now();
    let data = std::fs::read(path.as_ref())?;

    if data.len() < 12 { return Err(TableFileError::Truncated); }
    if &data[0..4] != MAGIC { return Err(TableFileError::BadMagic); }
    let version = read_u32(&data[4..8]);
    if version != VERSION { return Err(TableFileError::UnsupportedVersion(version)); }
    let header_len = read_u32(&data[8..12]) as usize;
    let body = data.get(12..).ok_or(TableFileError::Truncated)?;
    if body.len() < header_len { return Err(TableFileError::Truncated); }

    let header: TableHeader = bincode::deserialize(&body[..header_len])?;
    let vector = header.vector()?;

    let (expected, expected_bytes) = header.width.checked_mul(header.height)
        .and_then(|n| n.checked_mul(PIXEL_STRIDE))
        .and_then(|n| Some((n, n.checked_mul(4)?)))
        .ok_or(TableFileError::BadDimensions { width: header.width, height: header.height })?;

    let mut bytes = Vec::new();
    flate2::read::ZlibDecoder::new(&body[header_len..]).read_to_end(&mut bytes)?;

    if bytes.len() != expected_bytes {
        return Err(TableFileError::LengthMismatch { expected, found: bytes.len() / 4 });
    }
    let mut coefficients = vec![0.0f32; expected];
    bytemuck::cast_slice_mut::<f32, u8>(&mut coefficients).copy_from_slice(&bytes);
    if cfg!(target_endian = "big") {
        coefficients.iter_mut().for_each(|x| *x = f32::from_bits(u32::from_le(x.to_bits())));
    }

    let table = LookUpTable::new(header.width, header.height, coefficients, &vector, &header.make, &header.model, header.style, header.as_of_date);
    ::log::info!("Loaded {} {} {}x{} table from {} in {:.3}ms", table.make, table.model, table.width, table.height, path.as_ref().display(), _time.elapsed().as_micros() as f64 / 1000.0);
    Ok(table)
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_bytes(coefficients: &[f32]) -> std::borrow::Cow<'_, [u8]> {
    if cfg!(target_endian = "little") {
        std::borrow::Cow::Borrowed(bytemuck::cast_slice(coefficients))
    } else {
        std::borrow::Cow::Owned(coefficients.iter().flat_map(|x| x.to_le_bytes()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::pinhole_slots;
    use crate::lookup_table::{ Dimensions, slot };

    fn table() -> LookUpTable {
        let mut v = pinhole_slots();
        v[15] = 120.0;
        v[33] = 500.0;
        let v = CalibrationVector::from_slice(&v).unwrap();
        let mut buf = vec![0.0f32; 5 * 4 * PIXEL_STRIDE];
        for (i, px) in buf.chunks_exact_mut(PIXEL_STRIDE).enumerate() {
            px[slot::X_SLOPE] = i as f32 * 0.01;
            px[slot::QUARTIC + 1] = -0.25;
        }
        // One unresolved pixel must survive the trip
        buf[7 * PIXEL_STRIDE..7 * PIXEL_STRIDE + slot::RESIDUAL].fill(f32::NAN);
        let style = GenerationStyle::NativeCrop { native: Dimensions { w: 8, h: 6 }, rotated: true };
        LookUpTable::new(5, 4, buf, &v, "Acme", "Tall", style, NaiveDate::from_ymd_opt(2023, 6, 14))
    }

    #[test]
    fn saved_table_loads_back_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.dlut");
        let t = table();
        save(&t, &path).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, t);
        assert_eq!(loaded.unresolved_count(), 1);
        assert_eq!(loaded.bounding_box.min[0], f64::NEG_INFINITY);
        assert_eq!(loaded.calibration_vector().unwrap(), t.calibration_vector().unwrap());
    }

    #[test]
    fn rejects_foreign_and_future_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dlut");

        std::fs::write(&path, b"PNG\0\x01\0\0\0\0\0\0\0").unwrap();
        assert!(matches!(load(&path), Err(TableFileError::BadMagic)));

        std::fs::write(&path, b"DLUT\x02\0\0\0\0\0\0\0").unwrap();
        assert!(matches!(load(&path), Err(TableFileError::UnsupportedVersion(2))));

        std::fs::write(&path, b"DLUT\x01\0").unwrap();
        assert!(matches!(load(&path), Err(TableFileError::Truncated)));

        assert!(matches!(load(dir.path().join("missing.dlut")), Err(TableFileError::Io(_))));
    }

    fn write_raw(path: &Path, header: &TableHeader, coefficients: &[f32]) {
        let header = bincode::serialize(header).unwrap();
        let mut e = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        e.write_all(&le_bytes(coefficients)).unwrap();
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&VERSION.to_le_bytes());
        data.extend_from_slice(&(header.len() as u32).to_le_bytes());
        data.extend_from_slice(&header);
        data.extend_from_slice(&e.finish().unwrap());
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn rejects_cut_off_coefficients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dlut");
        let t = table();
        write_raw(&path, &TableHeader::of(&t), &t.coefficients()[..PIXEL_STRIDE * 3]);

        match load(&path) {
            Err(TableFileError::LengthMismatch { expected, found }) => assert_eq!((expected, found), (5 * 4 * PIXEL_STRIDE, 3 * PIXEL_STRIDE)),
            other => panic!("unexpected {:?}", other.map(|t| t.dimensions())),
        }
    }

    #[test]
    fn rejects_oversized_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.dlut");
        let t = table();
        let mut header = TableHeader::of(&t);
        header.width = usize::MAX / 4;
        write_raw(&path, &header, t.coefficients());

        match load(&path) {
            Err(TableFileError::BadDimensions { width, height }) => assert_eq!((width, height), (usize::MAX / 4, 4)),
            other => panic!("unexpected {:?}", other.map(|t| t.dimensions())),
        }
    }
}
