//! `git://` client transport (the daemon server role is out of scope).

use super::{ResponseStream, Service, SmartTransport};
use crate::error::GitResult;
use crate::pkt::{self, Frame, PktReader};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

pub const DEFAULT_GIT_PORT: u16 = 9418;

pub struct DaemonTransport {
    host: String,
    port: u16,
    path: String,
}

impl DaemonTransport {
    pub fn new(host: impl Into<String>, port: Option<u16>, path: impl Into<String>) -> Self {
        Self { host: host.into(), port: port.unwrap_or(DEFAULT_GIT_PORT), path: path.into() }
    }

    async fn connect(&self, service: Service, protocol_version: u8) -> GitResult<TcpStream> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let mut greeting = vec![];
        let mut line = format!("{} {}\0host={}\0", service.name(), self.path, self.host);
        if protocol_version == 2 {
            line.push_str("\0version=2\0");
        }
        pkt::encode_str(&mut greeting, &line)?;
        stream.write_all(&greeting).await?;
        Ok(stream)
    }
}

#[async_trait]
impl SmartTransport for DaemonTransport {
    async fn discover(&mut self, service: Service, protocol_version: u8) -> GitResult<Vec<Frame>> {
        let stream = self.connect(service, protocol_version).await?;
        let mut reader = PktReader::new(BufReader::new(stream));
        let mut frames = vec![];
        loop {
            let frame = reader.recv_frame().await?;
            let done = matches!(frame, Frame::Flush | Frame::End);
            frames.push(frame);
            if done {
                break;
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
        let stream = self.connect(service, protocol_version).await?;
        let mut reader = PktReader::new(BufReader::new(stream));
        // a fresh connection re-advertises; skip to the flush
        loop {
            match reader.recv_frame().await? {
                Frame::Flush | Frame::End => break,
                _ => continue,
            }
        }
        let mut stream = reader.into_inner().into_inner();
        stream.write_all(&request).await?;
        stream.flush().await?;
        let mut response = vec![];
        stream.read_to_end(&mut response).await?;
        Ok(Box::new(BufReader::new(std::io::Cursor::new(response))))
    }
}
