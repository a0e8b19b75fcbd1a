use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};

use crate::config::Credentials;
use crate::error::{Error, Result};

/// Something that can serve arbitrary byte ranges of one file.
pub trait ByteSource: Send + Sync {
    /// URL or path, for messages.
    fn describe(&self) -> &str;
    /// Total size in bytes.
    fn content_length(&self) -> Result<u64>;
    /// Bytes `start..=end`.
    fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>>;
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn describe(&self) -> &str {
        (**self).describe()
    }

    fn content_length(&self) -> Result<u64> {
        (**self).content_length()
    }

    fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        (**self).fetch_range(start, end)
    }
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

/// Where a data file lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Remote(String),
    Local(PathBuf),
}

impl Location {
    /// Absolute paths are local files, anything else is a URL.
    pub fn parse(s: &str) -> Self {
        if s.starts_with('/') {
            Location::Local(PathBuf::from(s))
        } else {
            Location::Remote(s.to_string())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Location::Local(_))
    }

    /// Append a file name to a base location.
    pub fn join(base: &str, name: &str) -> Self {
        Location::parse(&format!("{}/{}", base.trim_end_matches('/'), name))
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Remote(url) => f.write_str(url),
            Location::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpSource
// ---------------------------------------------------------------------------

/// Serves byte ranges of a URL with HTTP `Range` requests.
pub struct HttpSource {
    agent: ureq::Agent,
    url: String,
    authorization: Option<String>,
}

/// Build the blocking HTTP agent shared by all sources of a retriever.
pub fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

impl HttpSource {
    pub fn new(agent: ureq::Agent, url: impl Into<String>, credentials: Option<&Credentials>) -> Self {
        let url = url.into();
        let authorization = credentials.map(|c| {
            let token = STANDARD.encode(format!("{}:{}", c.user, c.password));
            format!("Basic {token}")
        });
        Self {
            agent,
            url,
            authorization,
        }
    }

    fn request(&self, range: Option<&str>) -> Result<ureq::Response> {
        let mut req = self.agent.get(&self.url);
        if let Some(auth) = &self.authorization {
            req = req.set("Authorization", auth);
        }
        if let Some(range) = range {
            req = req.set("Range", range);
        }
        match req.call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(status, _)) => Err(self.status_error(status)),
            Err(ureq::Error::Transport(t)) => Err(Error::Http {
                url: self.url.clone(),
                reason: t.to_string(),
            }),
        }
    }

    fn status_error(&self, status: u16) -> Error {
        match status {
            401 | 403 => {
                warn!("http auth rejected status={} url={}", status, self.url);
                Error::Auth {
                    url: self.url.clone(),
                    status,
                }
            }
            404 => Error::NotFound(self.url.clone()),
            _ => Error::Http {
                url: self.url.clone(),
                reason: format!("HTTP {status}"),
            },
        }
    }

    /// Download the whole file.
    pub fn fetch_all(&self) -> Result<Vec<u8>> {
        let resp = self.request(None)?;
        let mut body = Vec::new();
        resp.into_reader().read_to_end(&mut body)?;
        Ok(body)
    }
}

impl ByteSource for HttpSource {
    fn describe(&self) -> &str {
        &self.url
    }

    fn content_length(&self) -> Result<u64> {
        let resp = self.request(Some("bytes=0-0"))?;
        let status = resp.status();
        debug!("http length request status={} url={}", status, self.url);

        // Content-Range: bytes 0-0/<total>
        let length = if status == 206 {
            resp.header("content-range")
                .and_then(|v| v.rsplit('/').next())
                .and_then(|v| v.trim().parse::<u64>().ok())
        } else {
            resp.header("content-length")
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        length.ok_or_else(|| Error::Http {
            url: self.url.clone(),
            reason: "server did not report the file size".into(),
        })
    }

    fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let range = format!("bytes={start}-{end}");
        debug!("http fetch range={} url={}", range, self.url);
        let resp = self.request(Some(&range))?;
        let status = resp.status();

        let mut body = Vec::new();
        resp.into_reader().read_to_end(&mut body)?;

        if status == 206 {
            return Ok(body);
        }
        // The server ignored the range and sent the whole file.
        let (start, end) = (start as usize, end as usize);
        if start >= body.len() {
            return Err(Error::Http {
                url: self.url.clone(),
                reason: format!("range {range} beyond end of body ({} bytes)", body.len()),
            });
        }
        let end = end.min(body.len() - 1);
        Ok(body[start..=end].to_vec())
    }
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// Serves byte ranges of a local file.
pub struct FileSource {
    label: String,
    file: Mutex<File>,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        Ok(Self {
            label: path.display().to_string(),
            file: Mutex::new(file),
        })
    }
}

impl ByteSource for FileSource {
    fn describe(&self) -> &str {
        &self.label
    }

    fn content_length(&self) -> Result<u64> {
        let file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        Ok(file.metadata()?.len())
    }

    fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let len = file.metadata()?.len();
        if start >= len || end < start {
            return Ok(Vec::new());
        }
        let end = end.min(len - 1);
        let mut buf = vec![0u8; (end - start + 1) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_paths_are_local() {
        assert!(Location::parse("/global/cfs/cdirs/desi/x.fits").is_local());
        assert!(!Location::parse("https://data.desi.lbl.gov/desi/x.fits").is_local());
    }

    #[test]
    fn join_trims_trailing_slash() {
        assert_eq!(
            Location::join("https://host/dir/", "a.bin"),
            Location::Remote("https://host/dir/a.bin".into())
        );
    }

    #[test]
    fn file_source_clamps_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, (0u8..100).collect::<Vec<_>>()).unwrap();
        let src = FileSource::open(&path).unwrap();
        assert_eq!(src.content_length().unwrap(), 100);
        assert_eq!(src.fetch_range(10, 12).unwrap(), vec![10, 11, 12]);
        assert_eq!(src.fetch_range(98, 200).unwrap(), vec![98, 99]);
        assert!(src.fetch_range(100, 120).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileSource::open(&dir.path().join("nope.fits")),
            Err(Error::NotFound(_))
        ));
    }
}
