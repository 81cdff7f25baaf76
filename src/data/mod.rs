pub mod download;
pub mod pickle;

#[cfg(test)]
mod fixture;

pub use download::download_data;

use crate::ten;
use crate::data::pickle::Value;
use flate2::read::GzDecoder;
use log::debug;
use ndarray::{Array1, Array2, Ix1, Ix2};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Pickled MNIST, split 50k / 10k / 10k. Fetched with the `.gz` extension appended.
pub const MNIST_URL: &str = "http://deeplearning.net/data/mnist/mnist.pkl";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Download of {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Cannot derive a file name from url: {0}")]
    Url(String),
    #[error("Not a gzip archive: {}", .0.display())]
    Gzip(PathBuf),
    #[error("Pickle error: {0}")]
    Pickle(#[from] pickle::Error),
    #[error("Unexpected archive layout: {0}")]
    Layout(String),
}

/// Where the archive comes from and where it is cached.
#[derive(Debug, Clone)]
pub struct DataConfig {
    url: String,
    ext: String,
    base_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            url: MNIST_URL.to_string(),
            ext: ".gz".to_string(),
            base_path: std::env::temp_dir().join("fcprep"),
        }
    }
}

impl DataConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = ext.into();
        self
    }

    pub fn base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    pub fn archive_path(&self) -> Result<PathBuf, Error> {
        download::cache_path(&self.url, &self.ext, &self.base_path)
    }

    pub fn load(&self) -> Result<Dataset, Error> {
        get_data(self)
    }
}

/// Training and validation splits. The test split of the archive is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub x_train: Array2<f32>,
    pub y_train: Array1<i64>,
    pub x_valid: Array2<f32>,
    pub y_valid: Array1<i64>,
}

impl Dataset {
    /// Normalizes both input sets with the mean and std of the training inputs.
    /// Returns the normalized set together with `(mean, std)`.
    pub fn normalized(self) -> Result<(Dataset, (f32, f32)), ten::Error> {
        let (mean, std) = ten::stats(&self.x_train)?;
        let data = Dataset {
            x_train: ten::normalize(&self.x_train, mean, std),
            x_valid: ten::normalize(&self.x_valid, mean, std),
            ..self
        };
        Ok((data, (mean, std)))
    }
}

/// Fetches the archive (or reuses the cached copy) and decodes it.
pub fn get_data(config: &DataConfig) -> Result<Dataset, Error> {
    let path = download_data(&config.url, &config.ext, &config.base_path)?;
    load_archive(&path)
}

/// Decodes a gzip compressed pickle archive.
pub fn load_archive(path: &Path) -> Result<Dataset, Error> {
    let gz = GzDecoder::new(File::open(path)?);
    // the header is parsed up front, the body only while unpickling
    if gz.header().is_none() {
        return Err(Error::Gzip(path.to_path_buf()));
    }
    read_archive(BufReader::new(gz))
}

/// Decodes an uncompressed pickle holding `((x, y), (x, y), (x, y))`.
pub fn read_archive<R: Read>(r: R) -> Result<Dataset, Error> {
    let value = pickle::from_reader(r)?;
    let [train, valid, _test]: [Value; 3] = value
        .into_tuple()
        .and_then(|t| t.try_into().ok())
        .ok_or_else(|| Error::Layout("expected a tuple of three splits".into()))?;

    let (x_train, y_train) = split(train, "train")?;
    let (x_valid, y_valid) = split(valid, "valid")?;

    Ok(Dataset {
        x_train,
        y_train,
        x_valid,
        y_valid,
    })
}

fn split(v: Value, name: &str) -> Result<(Array2<f32>, Array1<i64>), Error> {
    let layout = |what: &str| Error::Layout(format!("{name} split: {what}"));

    let [x, y]: [Value; 2] = v
        .into_tuple()
        .and_then(|t| t.try_into().ok())
        .ok_or_else(|| layout("not an (inputs, labels) pair"))?;
    let x = x.into_array().ok_or_else(|| layout("inputs are not an array"))?;
    let y = y.into_array().ok_or_else(|| layout("labels are not an array"))?;

    let x = x
        .to_array::<f32>()?
        .into_dimensionality::<Ix2>()
        .map_err(|_| layout("inputs are not 2-D"))?;
    let y = y
        .to_array::<i64>()?
        .into_dimensionality::<Ix1>()
        .map_err(|_| layout("labels are not 1-D"))?;
    if x.nrows() != y.len() {
        return Err(layout("inputs and labels differ in length"));
    }

    debug!("Decoded {name}: inputs {:?}, labels {:?}", x.shape(), y.shape());
    Ok((x, y))
}
