//! Smart HTTP: discovery via `GET /info/refs?service=...`, one POST per
//! exchange. The actual HTTP implementation is a collaborator supplied by
//! the host through [`HttpClient`]; redirects beyond a single hop, proxies
//! and TLS are its problem.

use super::{ResponseStream, Service, SmartTransport};
use crate::error::{GitError, GitResult};
use crate::pkt::{self, Frame, PktReader};
use async_trait::async_trait;
use tokio::io::BufReader;

#[derive(Debug)]
pub struct HttpRequest {
    pub url: String,
    pub method: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct HttpResponse {
    pub status: u16,
    pub status_message: String,
    pub headers: Vec<(String, String)>,
    pub body: ResponseStream,
}

/// The single-function HTTP contract the library consumes.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> GitResult<HttpResponse>;
}

pub struct HttpTransport {
    client: Box<dyn HttpClient>,
    base_url: String,
    authorization: Option<String>,
}

impl HttpTransport {
    pub fn new(client: Box<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self { client, base_url: url.into().trim_end_matches('/').to_owned(), authorization: None }
    }

    fn common_headers(&self, protocol_version: u8) -> Vec<(String, String)> {
        let mut headers = vec![
            ("User-Agent".to_owned(), "ugit/0.1".to_owned()),
            ("Pragma".to_owned(), "no-cache".to_owned()),
        ];
        if protocol_version == 2 {
            headers.push(("Git-Protocol".to_owned(), "version=2".to_owned()));
        }
        if let Some(auth) = &self.authorization {
            headers.push(("Authorization".to_owned(), auth.clone()));
        }
        headers
    }

    async fn checked(&self, request: HttpRequest) -> GitResult<HttpResponse> {
        let url = request.url.clone();
        let response = self.client.request(request).await?;
        if response.status == 401 || response.status == 403 || response.status >= 500 {
            return Err(anyhow!(GitError::Http {
                status: response.status,
                msg: format!("{} for `{}`", response.status_message, url),
            }));
        }
        ensure!(
            (200..300).contains(&response.status),
            GitError::Http {
                status: response.status,
                msg: format!("{} for `{}`", response.status_message, url),
            }
        );
        Ok(response)
    }
}

#[async_trait]
impl SmartTransport for HttpTransport {
    async fn discover(&mut self, service: Service, protocol_version: u8) -> GitResult<Vec<Frame>> {
        let url = format!("{}/info/refs?service={}", self.base_url, service.name());
        let response = self
            .checked(HttpRequest {
                url,
                method: "GET",
                headers: self.common_headers(protocol_version),
                body: vec![],
            })
            .await?;

        let mut reader = PktReader::new(response.body);
        let mut frames = vec![];
        let mut first = true;
        loop {
            let frame = reader.recv_frame().await?;
            match &frame {
                // smart servers prefix `# service=git-...` plus a flush
                Frame::Data(bytes) if first && bytes.starts_with(b"# service=") => {
                    first = false;
                    match reader.recv_frame().await? {
                        Frame::Flush => continue,
                        _ => bail!(GitError::corrupt("missing flush after service header")),
                    }
                }
                Frame::End => break,
                _ => {
                    first = false;
                    let done = frame.is_flush();
                    frames.push(frame);
                    if done {
                        break;
                    }
                }
            }
        }
        Ok(frames)
    }

    async fn exchange(
        &mut self,
        service: Service,
        protocol_version: u8,
        request: Vec<u8>,
    ) -> GitResult<ResponseStream> {
        let url = format!("{}/{}", self.base_url, service.name());
        let mut headers = self.common_headers(protocol_version);
        headers.push((
            "Content-Type".to_owned(),
            format!("application/x-{}-request", service.name()),
        ));
        headers.push((
            "Accept".to_owned(),
            format!("application/x-{}-result", service.name()),
        ));
        let response =
            self.checked(HttpRequest { url, method: "POST", headers, body: request }).await?;
        Ok(response.body)
    }

    fn set_basic_auth(&mut self, user: &str, pass: &str) {
        let encoded = base64::encode(format!("{}:{}", user, pass));
        self.authorization = Some(format!("Basic {}", encoded));
    }
}

/// An in-memory `HttpClient` speaking to an in-process repository; the test
/// double for the smart-HTTP path.
#[cfg(test)]
pub struct LoopbackHttp {
    pub repo: crate::repo::Repository,
}

#[cfg(test)]
#[async_trait]
impl HttpClient for LoopbackHttp {
    async fn request(&self, request: HttpRequest) -> GitResult<HttpResponse> {
        use crate::protocol::{receive_pack, upload_pack};
        let v2 = request
            .headers
            .iter()
            .any(|(name, value)| name == "Git-Protocol" && value.contains("version=2"));
        let version = if v2 { 2 } else { 1 };

        let body: Vec<u8> = if request.method == "GET" {
            let service = if request.url.contains("git-receive-pack") {
                Service::ReceivePack
            } else {
                Service::UploadPack
            };
            let advert = match service {
                Service::UploadPack => upload_pack::advertisement(&self.repo, version)?,
                Service::ReceivePack => receive_pack::advertisement(&self.repo)?,
            };
            let mut body = vec![];
            pkt::encode_str(&mut body, &format!("# service={}\n", service.name()))?;
            pkt::encode_flush(&mut body);
            body.extend(advert);
            body
        } else {
            let mut out = std::io::Cursor::new(vec![]);
            if request.url.ends_with("git-receive-pack") {
                receive_pack::handle_request(&self.repo, &request.body, &mut out).await?;
            } else {
                upload_pack::handle_request(&self.repo, &request.body, &mut out).await?;
            }
            out.into_inner()
        };
        Ok(HttpResponse {
            status: 200,
            status_message: "OK".to_owned(),
            headers: vec![],
            body: Box::new(BufReader::new(std::io::Cursor::new(body))),
        })
    }
}
