use std::borrow::Cow;

use reqwest::header::HeaderMap;

pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: bytes::Bytes,
    headers_size: usize,
}

impl Response {
    pub async fn read(res: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status = res.status().as_u16();
        let headers = res.headers().clone();
        // Calculate headers size once during construction
        let headers_size = headers
            .iter()
            .map(|(k, v)| k.as_str().len() + v.len() + 4)
            .sum::<usize>()
            + 12;
        let body = res.bytes().await?;
        Ok(Self {
            status,
            headers,
            body,
            headers_size,
        })
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &bytes::Bytes {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.body)
    }

    /// Returns total response size (body + headers + status line approximation)
    pub fn total_size(&self) -> usize {
        self.body.len() + self.headers_size
    }
}

#[cfg(test)]
impl Response {
    pub(crate) fn fake(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: bytes::Bytes::copy_from_slice(body.as_bytes()),
            headers_size: 0,
        }
    }
}
