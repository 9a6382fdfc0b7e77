use std::{net::SocketAddr, time::Duration};

use tokio::time::timeout;

use super::{
    endpoint::Dealer,
    error::Error,
    wire::{Request, Response, DELIMITER},
    Frames,
};

/// One-request-at-a-time client for a broker frontend or a direct-mode
/// worker. Requests go out behind an empty delimiter frame, which the
/// receiving side uses to tell the envelope from the body.
pub struct Client {
    dealer: Dealer,
    timeout: Duration,
}

impl Client {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub async fn connect(remote: SocketAddr) -> Result<Self, Error> {
        Ok(Client {
            dealer: Dealer::connect(remote).await?,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a request body and returns the reply body.
    pub async fn request_frames(
        &mut self,
        body: Frames,
    ) -> Result<Frames, Error> {
        let mut frames = Vec::with_capacity(body.len() + 1);
        frames.push(DELIMITER.to_vec());
        frames.extend(body);
        self.dealer.send(&frames).await?;

        let mut reply = timeout(self.timeout, self.dealer.recv())
            .await
            .map_err(|_| Error::Timeout)?
            .ok_or(Error::ConnectionClosed)?;
        if reply.first().map_or(false, |f| f.is_empty()) {
            reply.remove(0);
        }
        Ok(reply)
    }

    pub async fn request(
        &mut self,
        request: &Request,
    ) -> Result<Response, Error> {
        let reply = self.request_frames(request.encode()).await?;
        Response::decode(&reply)
    }
}
