//! Local-path transport: the server side runs in-process against the
//! target repository over an in-memory duplex, which also makes it the
//! end-to-end harness for the protocol engine.

use super::{ResponseStream, Service, SmartTransport};
use crate::error::GitResult;
use crate::pkt::{self, Frame};
use crate::protocol::{receive_pack, upload_pack};
use crate::repo::Repository;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::BufReader;

pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open_repo(&self) -> GitResult<Repository> {
        Repository::open(&self.path)
    }
}

#[async_trait]
impl SmartTransport for FileTransport {
    async fn discover(&mut self, service: Service, protocol_version: u8) -> GitResult<Vec<Frame>> {
        let repo = self.open_repo()?;
        let bytes = match service {
            Service::UploadPack => upload_pack::advertisement(&repo, protocol_version)?,
            Service::ReceivePack => receive_pack::advertisement(&repo)?,
        };
        pkt::decode_all(&bytes)
    }

    async fn exchange(
        &mut self,
        service: Service,
        _protocol_version: u8,
        request: Vec<u8>,
    ) -> GitResult<ResponseStream> {
        let repo = self.open_repo()?;
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let result = match service {
                Service::UploadPack =>
                    upload_pack::handle_request(&repo, &request, server).await,
                Service::ReceivePack =>
                    receive_pack::handle_request(&repo, &request, server).await,
            };
            if let Err(err) = result {
                warn!("in-process {} failed: {}", service, err);
            }
        });
        Ok(Box::new(BufReader::new(client)))
    }
}
