//! Worker side of the connection: dials the runner and exchanges envelopes.

use std::io::BufReader;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::message::{Message, MessageType};
use crate::core::serializer::JsonDataSerializer;
use crate::error::CommunicationError;
use crate::io::channel::{CommunicationChannel, LengthPrefixChannel};

pub struct TestHostClient {
    channel: LengthPrefixChannel,
    serializer: JsonDataSerializer,
}

impl TestHostClient {
    /// Connect to the runner listening on `127.0.0.1:port`.
    #[instrument(skip_all, fields(port))]
    pub fn connect(port: u16, timeout: Duration, max_frame_bytes: usize) -> Result<Self> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .with_context(|| format!("connect to runner at {addr}"))?;
        stream.set_nodelay(true).context("set nodelay")?;
        let reader = stream.try_clone().context("clone stream")?;
        debug!("connected to runner");
        Ok(Self {
            channel: LengthPrefixChannel::new(BufReader::new(reader), stream, max_frame_bytes),
            serializer: JsonDataSerializer::new(),
        })
    }

    /// Block for the next envelope. `None` once the runner hangs up.
    pub fn receive(&self) -> Result<Option<Message>> {
        match self.channel.receive() {
            Ok(raw) => Ok(Some(
                self.serializer
                    .deserialize_message(&raw)
                    .context("decode message from runner")?,
            )),
            Err(CommunicationError::PeerClosed) => Ok(None),
            Err(err) => Err(err).context("receive from runner"),
        }
    }

    pub fn serializer(&self) -> &JsonDataSerializer {
        &self.serializer
    }

    pub fn send<T: Serialize>(&self, kind: MessageType, payload: &T) -> Result<()> {
        let raw = self
            .serializer
            .serialize_payload(kind, payload)
            .with_context(|| format!("encode {kind}"))?;
        self.channel
            .send(&raw)
            .with_context(|| format!("send {kind}"))
    }

    pub fn send_signal(&self, kind: MessageType) -> Result<()> {
        let raw = self
            .serializer
            .serialize_message(kind)
            .with_context(|| format!("encode {kind}"))?;
        self.channel
            .send(&raw)
            .with_context(|| format!("send {kind}"))
    }
}
