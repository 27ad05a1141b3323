use std::convert::Infallible;
use std::io;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;

use crate::storage::CacheObject;

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

const CHANNEL_DEPTH: usize = 8;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(never).boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new().map_err(never).boxed_unsync()
}

/// Streams a cache entry part by part.
pub fn from_object(object: CacheObject) -> ProxyBody {
    let stream = futures::stream::try_unfold(object, |mut object| async move {
        let chunk = object.next_chunk().await?;
        Ok::<_, io::Error>(chunk.map(|data| (Frame::data(data), object)))
    });
    StreamBody::new(stream).boxed_unsync()
}

fn never(err: Infallible) -> io::Error {
    match err {}
}

/// A streaming body fed from another task. Sends fail once the client has
/// gone away and hyper dropped the body.
pub fn channel() -> (BodySender, ProxyBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    (BodySender { tx }, StreamBody::new(rx).boxed_unsync())
}

#[derive(Debug)]
pub struct Disconnected;

pub struct BodySender {
    tx: mpsc::Sender<Result<Frame<Bytes>, io::Error>>,
}

impl BodySender {
    pub async fn send(&mut self, data: Bytes) -> Result<(), Disconnected> {
        self.tx.send(Ok(Frame::data(data))).await.map_err(|_| Disconnected)
    }

    /// Ends the body with an error so the client sees a broken transfer
    /// instead of a short but well-formed one.
    pub async fn fail(mut self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}
