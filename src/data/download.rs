use crate::data::Error;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Path `url` is cached under inside `dir`: its last path segment followed by `ext`.
pub fn cache_path(url: &str, ext: &str, dir: &Path) -> Result<PathBuf, Error> {
    let name = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Url(url.to_string()))?;
    Ok(dir.join(format!("{name}{ext}")))
}

/// Returns the local copy of `url + ext`, downloading it into `dir` first
/// when it is not cached yet.
pub fn download_data(url: &str, ext: &str, dir: &Path) -> Result<PathBuf, Error> {
    let path = cache_path(url, ext, dir)?;
    if path.is_file() {
        debug!("Using cached {}", path.display());
        return Ok(path);
    }

    fs::create_dir_all(dir)?;
    let src = format!("{url}{ext}");
    let mut part = path.clone().into_os_string();
    part.push(".part");
    let part = PathBuf::from(part);

    info!("Downloading {src} to {}", path.display());
    match fetch(&src, &part) {
        Ok(n) => debug!("Fetched {n} bytes"),
        Err(e) => {
            // Never leave a truncated file behind
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    }
    fs::rename(&part, &path)?;
    Ok(path)
}

fn fetch(url: &str, dest: &Path) -> Result<u64, Error> {
    let http = |source: reqwest::Error| Error::Http {
        url: url.to_string(),
        source,
    };
    let mut resp = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(http)?;

    let mut out = BufWriter::new(File::create(dest)?);
    let n = io::copy(&mut resp, &mut out)?;
    out.flush()?;
    Ok(n)
}
