use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

/// Shared outbound HTTP client. Three consumers: the direct-upstream
/// connector (POST, possibly SSE), the image downloader, and the file-bed
/// uploader; they all ride one connection pool.
#[derive(Clone)]
pub struct BridgeHttpClient {
    client: wreq::Client,
    stream_idle_timeout: Duration,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: HttpBody,
}

#[derive(Debug)]
pub enum HttpBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

impl HttpResponse {
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            HttpBody::Bytes(bytes) => bytes,
            HttpBody::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                Bytes::from(out)
            }
        }
    }
}

impl BridgeHttpClient {
    pub fn new(client: wreq::Client, stream_idle_timeout: Duration) -> Self {
        Self {
            client,
            stream_idle_timeout,
        }
    }

    pub fn raw(&self) -> wreq::Client {
        self.client.clone()
    }

    /// POST a JSON body. Non-2xx responses and non-stream requests are read
    /// fully; otherwise the body is relayed chunk by chunk with an idle
    /// timeout between reads.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
        want_stream: bool,
        total_timeout: Duration,
    ) -> Result<HttpResponse, String> {
        let mut builder = self.client.post(url).timeout(total_timeout);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let resp = builder
            .json(body)
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;

        let status = resp.status().as_u16();
        let success = (200..300).contains(&status);
        if !success || !want_stream {
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| format!("body read failed: {err}"))?;
            return Ok(HttpResponse {
                status,
                body: HttpBody::Bytes(bytes),
            });
        }

        let idle = self.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => break,
                };
                let Some(item) = item else {
                    break;
                };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(HttpResponse {
            status,
            body: HttpBody::Stream(rx),
        })
    }
}
