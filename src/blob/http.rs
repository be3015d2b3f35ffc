use super::{check_key, Blob, BlobStore, Precondition};
use crate::error::BlobError;
use base64::Engine;
use std::io::Read as _;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on a snapshot body; anything larger is refused.
const MAX_BODY: u64 = 512 * 1024 * 1024;

pub fn run_password_command(cmd: &str) -> Result<String, BlobError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| BlobError::Auth(format!("failed to execute password command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BlobError::Auth(format!(
            "password command exited with {}: {}",
            output.status, stderr
        )));
    }

    let password = String::from_utf8(output.stdout)
        .map_err(|e| BlobError::Auth(format!("password command output is not valid UTF-8: {}", e)))?;

    Ok(password.trim_end_matches('\n').to_string())
}

/// Object store speaking plain HTTP: GET, PUT and DELETE on `{base}/{key}`
/// with `If-Match` / `If-None-Match` preconditions and ETag responses
/// (WebDAV, S3-compatible gateways, nginx with dav_methods).
pub struct HttpBlobStore {
    agent: ureq::Agent,
    base_url: String,
    auth: Option<String>,
}

fn auth_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    format!("Basic {}", encoded)
}

fn truncate_str(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl HttpBlobStore {
    pub fn new(base_url: &str, credentials: Option<(String, String)>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        HttpBlobStore {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: credentials.map(|(u, p)| auth_header(&u, &p)),
        }
    }

    fn url(&self, key: &str) -> Result<String, BlobError> {
        check_key(key)?;
        Ok(format!("{}/{}", self.base_url, key))
    }

    fn request(&self, method: &str, url: &str, cond: &Precondition) -> ureq::Request {
        let mut req = self.agent.request(method, url);
        if let Some(auth) = &self.auth {
            req = req.set("Authorization", auth);
        }
        match cond {
            Precondition::None => req,
            Precondition::DoesNotExist => req.set("If-None-Match", "*"),
            Precondition::Matches(etag) => req.set("If-Match", etag),
        }
    }

    /// ETag of the object as the server reports it, via HEAD when the write
    /// response carried none.
    fn head_etag(&self, url: &str) -> Result<String, BlobError> {
        let resp = self
            .request("HEAD", url, &Precondition::None)
            .call()
            .map_err(|e| status_error(url, e))?;
        resp.header("etag")
            .map(str::to_string)
            .ok_or_else(|| BlobError::Transport(format!("{} returned no ETag", url)))
    }
}

/// Read a whole body, refusing (not truncating) one over `limit` bytes.
fn read_capped(reader: impl std::io::Read, limit: u64, url: &str) -> Result<Vec<u8>, BlobError> {
    let mut data = Vec::new();
    reader.take(limit + 1).read_to_end(&mut data)?;
    if data.len() as u64 > limit {
        return Err(BlobError::Transport(format!(
            "{} body exceeds {} bytes",
            url, limit
        )));
    }
    Ok(data)
}

fn status_error(url: &str, err: ureq::Error) -> BlobError {
    match err {
        ureq::Error::Status(412, _) => BlobError::PreconditionFailed(url.to_string()),
        ureq::Error::Status(401, _) | ureq::Error::Status(403, _) => {
            BlobError::Auth(format!("{} refused credentials", url))
        }
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            warn!("[Blob] HTTP {} from {}: {}", code, url, truncate_str(&body, 200));
            BlobError::Transport(format!("HTTP {} from {}", code, url))
        }
        ureq::Error::Transport(t) => BlobError::Transport(t.to_string()),
    }
}

impl BlobStore for HttpBlobStore {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn get(&self, key: &str) -> Result<Option<Blob>, BlobError> {
        let url = self.url(key)?;
        let resp = match self.request("GET", &url, &Precondition::None).call() {
            Ok(resp) => resp,
            Err(ureq::Error::Status(404, _)) => {
                debug!("[Blob] {} absent", url);
                return Ok(None);
            }
            Err(e) => return Err(status_error(&url, e)),
        };
        let etag = resp
            .header("etag")
            .map(str::to_string)
            .ok_or_else(|| BlobError::Transport(format!("{} returned no ETag", url)))?;
        let data = read_capped(resp.into_reader(), MAX_BODY, &url)?;
        debug!("[Blob] GET {} ({} bytes, etag {})", url, data.len(), etag);
        Ok(Some(Blob { data, etag }))
    }

    fn put(&self, key: &str, data: &[u8], cond: &Precondition) -> Result<String, BlobError> {
        let url = self.url(key)?;
        let resp = self
            .request("PUT", &url, cond)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(data)
            .map_err(|e| status_error(&url, e))?;
        let etag = match resp.header("etag") {
            Some(etag) => etag.to_string(),
            None => self.head_etag(&url)?,
        };
        debug!("[Blob] PUT {} ({} bytes, etag {})", url, data.len(), etag);
        Ok(etag)
    }

    fn delete(&self, key: &str, cond: &Precondition) -> Result<bool, BlobError> {
        let url = self.url(key)?;
        match self.request("DELETE", &url, cond).call() {
            Ok(_) => Ok(true),
            Err(ureq::Error::Status(404, _)) if *cond == Precondition::None => Ok(false),
            Err(ureq::Error::Status(404, _)) => Err(BlobError::PreconditionFailed(url)),
            Err(e) => Err(status_error(&url, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_header_is_basic() {
        assert_eq!(auth_header("user", "pass"), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_password_command() {
        assert_eq!(run_password_command("echo secret").unwrap(), "secret");
        assert!(matches!(
            run_password_command("exit 3"),
            Err(BlobError::Auth(_))
        ));
    }

    #[test]
    fn test_oversized_body_is_refused() {
        let body = vec![7u8; 16];
        assert_eq!(read_capped(&body[..], 16, "u").unwrap(), body);
        assert!(matches!(
            read_capped(&body[..], 15, "u"),
            Err(BlobError::Transport(_))
        ));
    }

    #[test]
    fn test_urls_reject_path_escapes() {
        let store = HttpBlobStore::new("http://h/dav/", None, Duration::from_secs(1));
        assert_eq!(store.url("store.json").unwrap(), "http://h/dav/store.json");
        assert!(store.url("../etc").is_err());
    }
}
