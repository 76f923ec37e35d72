//! Index files: a fixed header describing the indexed dataset, followed by the
//! configuration and the structure. The dataset itself is never written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use bincode::Options;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::algorithms::NnIndex;
use crate::core::{Config, IndexError, Result};
use crate::metricdata::{Dataset, Element, ElementType};

const SIGNATURE: [u8; 6] = *b"RFLANN";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexHeader {
    signature: [u8; 6],
    version: u32,
    algorithm: u8,
    element_type: ElementType,
    rows: u64,
    cols: u64,
}

#[derive(Serialize)]
struct IndexBodyRef<'s> {
    config: &'s Config,
    speedup: f64,
    structure: &'s NnIndex,
}

#[derive(Deserialize)]
pub(crate) struct SavedIndex {
    pub(crate) config: Config,
    pub(crate) speedup: f64,
    pub(crate) structure: NnIndex,
}

fn options(limit: u64) -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(limit)
}

fn format_error(e: bincode::Error) -> IndexError {
    match *e {
        bincode::ErrorKind::Io(io) if io.kind() != std::io::ErrorKind::UnexpectedEof => IndexError::Io(io.to_string()),
        other => IndexError::Format(other.to_string()),
    }
}

pub(crate) fn save_index<T: Element>(
    path: &Path,
    data: &Dataset<'_, T>,
    config: &Config,
    speedup: f64,
    structure: &NnIndex,
) -> Result<()> {
    let header = IndexHeader {
        signature: SIGNATURE,
        version: FORMAT_VERSION,
        algorithm: structure.algorithm().tag(),
        element_type: T::ELEMENT_TYPE,
        rows: data.num_points() as u64,
        cols: data.dimensions() as u64,
    };
    let body = IndexBodyRef {
        config,
        speedup,
        structure,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    let options = options(u64::MAX);
    options.serialize_into(&mut writer, &header).map_err(format_error)?;
    options.serialize_into(&mut writer, &body).map_err(format_error)?;
    writer.flush()?;

    debug!("Saved {:?} index to {}", structure.algorithm(), path.display());
    Ok(())
}

/// Reads an index file and checks it against the dataset it will search.
pub(crate) fn load_index<T: Element>(path: &Path, data: &Dataset<'_, T>) -> Result<SavedIndex> {
    let file = File::open(path)?;
    let limit = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let options = options(limit);

    let header: IndexHeader = options.deserialize_from(&mut reader).map_err(format_error)?;
    if header.signature != SIGNATURE {
        return Err(IndexError::Format("not an index file".to_string()));
    }
    if header.version != FORMAT_VERSION {
        return Err(IndexError::Format(format!("unsupported format version {}", header.version)));
    }
    if header.element_type != T::ELEMENT_TYPE {
        return Err(IndexError::Format(format!(
            "index built over {:?} points, dataset holds {:?}",
            header.element_type,
            T::ELEMENT_TYPE
        )));
    }
    if header.rows != data.num_points() as u64 || header.cols != data.dimensions() as u64 {
        return Err(IndexError::Format(format!(
            "index built over a {}x{} dataset, got {}x{}",
            header.rows,
            header.cols,
            data.num_points(),
            data.dimensions()
        )));
    }

    let saved: SavedIndex = options.deserialize_from(&mut reader).map_err(format_error)?;
    if saved.structure.algorithm().tag() != header.algorithm {
        return Err(IndexError::Format("structure does not match the header".to_string()));
    }
    saved
        .structure
        .check_integrity(data.num_points(), data.dimensions(), T::ELEMENT_TYPE)
        .map_err(IndexError::Format)?;

    debug!("Loaded {:?} index from {}", saved.structure.algorithm(), path.display());
    Ok(saved)
}
