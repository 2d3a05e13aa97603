//! Origin filesystem: the slow, read-only, range-addressable backing store
//! the cache fronts. Narrowed to exactly the three operations the cache
//! needs — `open`/`pread`/`fstat` — reusing the teacher's HTTP transport and
//! retry-with-backoff near verbatim.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{CacheError, Result};

#[derive(Clone, Debug)]
pub struct OriginConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
        }
    }
}

fn retry_delay(base: Duration, max: Duration, attempt: usize) -> Duration {
    let shift = attempt.min(20);
    let mult = 1u32.checked_shl(shift as u32).unwrap_or(u32::MAX);
    let delay = base.checked_mul(mult).unwrap_or(max);
    if delay > max { max } else { delay }
}

#[derive(Debug)]
pub struct OriginRange {
    pub data: Vec<u8>,
    pub content_range_total: Option<u64>,
}

/// Blocking transport, run inside `spawn_blocking` by [`OriginFile`]. Mirrors
/// the teacher's `BlockingHttp`.
pub trait BlockingOrigin: Send + Sync {
    fn get_content_length(&self, url: &str) -> Result<Option<u64>>;
    fn get_range(&self, url: &str, start: u64, end: u64) -> Result<OriginRange>;
}

#[cfg(all(not(feature = "reqwest"), not(feature = "curl")))]
compile_error!("Enable either `curl` (default) or `reqwest` feature.");

fn parse_content_range(header: &str) -> Option<u64> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 2 || parts[0] != "bytes" {
        return None;
    }
    let total = parts[1].split('/').nth(1)?;
    total.parse::<u64>().ok()
}

#[cfg(feature = "reqwest")]
pub struct ReqwestOrigin {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestOrigin {
    pub fn new(config: &OriginConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.read_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.idle_timeout)
            .build()
            .expect("failed to build HTTP client");
        Self { client }
    }
}

#[cfg(feature = "reqwest")]
impl BlockingOrigin for ReqwestOrigin {
    fn get_content_length(&self, url: &str) -> Result<Option<u64>> {
        let response = self
            .client
            .head(url)
            .send()
            .map_err(|e| CacheError::Origin(e.to_string()))?;
        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(response.content_length())
    }

    fn get_range(&self, url: &str, start: u64, end: u64) -> Result<OriginRange> {
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={start}-{end}"))
            .send()
            .map_err(|e| CacheError::Origin(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 416 {
            return Ok(OriginRange {
                data: Vec::new(),
                content_range_total: None,
            });
        }
        if status == 200 {
            return Err(CacheError::Origin(
                "origin does not support range requests".into(),
            ));
        }
        if status != 206 {
            return Err(CacheError::Origin(format!("origin returned status {status}")));
        }

        let total = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let data = response
            .bytes()
            .map_err(|e| CacheError::Origin(e.to_string()))?
            .to_vec();

        Ok(OriginRange {
            data,
            content_range_total: total,
        })
    }
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
pub struct CurlOrigin {
    connect_timeout: Duration,
    read_timeout: Duration,
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
impl CurlOrigin {
    pub fn new(config: &OriginConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        }
    }

    fn request(
        &self,
        url: &str,
        head_only: bool,
        range: Option<(u64, u64)>,
    ) -> Result<(u16, Vec<u8>, ahash::HashMap<String, String>)> {
        let mut easy = curl::easy::Easy::new();
        easy.url(url).map_err(|e| CacheError::Origin(e.to_string()))?;
        easy.connect_timeout(self.connect_timeout)
            .map_err(|e| CacheError::Origin(e.to_string()))?;
        easy.timeout(self.read_timeout)
            .map_err(|e| CacheError::Origin(e.to_string()))?;
        easy.follow_location(true)
            .map_err(|e| CacheError::Origin(e.to_string()))?;

        if head_only {
            easy.nobody(true).map_err(|e| CacheError::Origin(e.to_string()))?;
            easy.custom_request("HEAD")
                .map_err(|e| CacheError::Origin(e.to_string()))?;
        }
        if let Some((start, end)) = range {
            easy.range(&format!("{start}-{end}"))
                .map_err(|e| CacheError::Origin(e.to_string()))?;
        }

        use ahash::HashMapExt;
        let mut data = Vec::new();
        let mut headers = ahash::HashMap::<String, String>::new();
        {
            let mut transfer = easy.transfer();
            transfer
                .write_function(|chunk| {
                    data.extend_from_slice(chunk);
                    Ok(chunk.len())
                })
                .map_err(|e| CacheError::Origin(e.to_string()))?;
            transfer
                .header_function(|header| {
                    if let Ok(line) = std::str::from_utf8(header) {
                        let line = line.trim();
                        if let Some((name, value)) = line.split_once(':') {
                            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                        }
                    }
                    true
                })
                .map_err(|e| CacheError::Origin(e.to_string()))?;
            transfer.perform().map_err(|e| CacheError::Origin(e.to_string()))?;
        }

        let status = easy.response_code().map_err(|e| CacheError::Origin(e.to_string()))? as u16;
        Ok((status, data, headers))
    }
}

#[cfg(all(not(feature = "reqwest"), feature = "curl"))]
impl BlockingOrigin for CurlOrigin {
    fn get_content_length(&self, url: &str) -> Result<Option<u64>> {
        let (status, _, headers) = self.request(url, true, None)?;
        if (200..300).contains(&status) {
            return Ok(headers.get("content-length").and_then(|v| v.parse::<u64>().ok()));
        }
        Ok(None)
    }

    fn get_range(&self, url: &str, start: u64, end: u64) -> Result<OriginRange> {
        let (status, data, headers) = self.request(url, false, Some((start, end)))?;

        if status == 416 {
            return Ok(OriginRange {
                data: Vec::new(),
                content_range_total: None,
            });
        }
        if status == 200 {
            return Err(CacheError::Origin(
                "origin does not support range requests".into(),
            ));
        }
        if status != 206 {
            return Err(CacheError::Origin(format!("origin returned status {status}")));
        }

        let total = headers
            .get("content-range")
            .and_then(|v| parse_content_range(v));

        Ok(OriginRange {
            data,
            content_range_total: total,
        })
    }
}

fn build_default_transport(config: &OriginConfig) -> Arc<dyn BlockingOrigin> {
    #[cfg(feature = "reqwest")]
    {
        Arc::new(ReqwestOrigin::new(config))
    }
    #[cfg(all(not(feature = "reqwest"), feature = "curl"))]
    {
        Arc::new(CurlOrigin::new(config))
    }
}

/// A single origin object, addressed by URL. Distinct from [`MediaFile`] —
/// an origin file is read-only and not positioned for writes.
#[async_trait]
pub trait OriginFile: Send + Sync {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
    async fn fstat(&self) -> Result<Option<u64>>;
}

#[async_trait]
pub trait OriginFs: Send + Sync {
    async fn open(&self, url: &str) -> Result<Arc<dyn OriginFile>>;
}

pub struct HttpOriginFile {
    url: Arc<str>,
    transport: Arc<dyn BlockingOrigin>,
    config: OriginConfig,
}

impl HttpOriginFile {
    fn get_range_with_retry(&self, start: u64, end: u64) -> Result<OriginRange> {
        let mut attempt = 0;
        loop {
            match self.transport.get_range(&self.url, start, end) {
                Ok(v) => return Ok(v),
                Err(CacheError::Origin(err)) => {
                    if attempt >= self.config.retry_max_attempts {
                        return Err(CacheError::Origin(err));
                    }
                }
                Err(e) => return Err(e),
            }
            std::thread::sleep(retry_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt,
            ));
            attempt += 1;
        }
    }

    fn get_content_length_with_retry(&self) -> Result<Option<u64>> {
        let mut attempt = 0;
        loop {
            match self.transport.get_content_length(&self.url) {
                Ok(v) => return Ok(v),
                Err(CacheError::Origin(err)) => {
                    if attempt >= self.config.retry_max_attempts {
                        return Err(CacheError::Origin(err));
                    }
                }
                Err(e) => return Err(e),
            }
            std::thread::sleep(retry_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt,
            ));
            attempt += 1;
        }
    }
}

#[async_trait]
impl OriginFile for HttpOriginFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let start = offset;
        let end = offset + buf.len() as u64 - 1;
        let this = HttpOriginFile {
            url: Arc::clone(&self.url),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        };
        let len = buf.len();
        let range = tokio::task::spawn_blocking(move || this.get_range_with_retry(start, end))
            .await
            .map_err(|e| CacheError::Origin(e.to_string()))??;
        let n = range.data.len().min(len);
        buf[..n].copy_from_slice(&range.data[..n]);
        Ok(n)
    }

    async fn fstat(&self) -> Result<Option<u64>> {
        let this = HttpOriginFile {
            url: Arc::clone(&self.url),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        };
        tokio::task::spawn_blocking(move || this.get_content_length_with_retry())
            .await
            .map_err(|e| CacheError::Origin(e.to_string()))?
    }
}

pub struct HttpOriginFs {
    transport: Arc<dyn BlockingOrigin>,
    config: OriginConfig,
}

impl HttpOriginFs {
    pub fn new(config: OriginConfig) -> Self {
        let transport = build_default_transport(&config);
        Self { transport, config }
    }

    pub fn with_transport(transport: Arc<dyn BlockingOrigin>, config: OriginConfig) -> Self {
        Self { transport, config }
    }
}

#[async_trait]
impl OriginFs for HttpOriginFs {
    async fn open(&self, url: &str) -> Result<Arc<dyn OriginFile>> {
        Ok(Arc::new(HttpOriginFile {
            url: Arc::from(url),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory origin for unit/integration tests: serves byte ranges out
    /// of a fixed buffer, simulating an immutable remote blob.
    pub struct MemOriginFs {
        files: StdMutex<ahash::HashMap<String, Arc<Vec<u8>>>>,
    }

    impl MemOriginFs {
        pub fn new() -> Self {
            use ahash::HashMapExt;
            Self {
                files: StdMutex::new(ahash::HashMap::new()),
            }
        }

        pub fn put(&self, url: &str, data: Vec<u8>) {
            self.files.lock().unwrap().insert(url.to_string(), Arc::new(data));
        }
    }

    impl Default for MemOriginFs {
        fn default() -> Self {
            Self::new()
        }
    }

    struct MemOriginFile {
        data: Arc<Vec<u8>>,
    }

    #[async_trait]
    impl OriginFile for MemOriginFile {
        async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }

        async fn fstat(&self) -> Result<Option<u64>> {
            Ok(Some(self.data.len() as u64))
        }
    }

    #[async_trait]
    impl OriginFs for MemOriginFs {
        async fn open(&self, url: &str) -> Result<Arc<dyn OriginFile>> {
            let data = self
                .files
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .ok_or_else(|| CacheError::NotFound(url.to_string()))?;
            Ok(Arc::new(MemOriginFile { data }))
        }
    }

    #[tokio::test]
    async fn mem_origin_round_trip() {
        let fs = MemOriginFs::new();
        fs.put("blob://x", vec![1, 2, 3, 4, 5]);
        let file = fs.open("blob://x").await.unwrap();
        let mut buf = [0u8; 3];
        let n = file.pread(&mut buf, 1).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, [2, 3, 4]);
        assert_eq!(file.fstat().await.unwrap(), Some(5));
    }
}
