use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::protocol::{Command, Frame, Reply, Serialization, decode_value, encode_value};
use super::{Bus, BusError, KvPairs};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// DiME client over a WebSocket, one frame per binary message.
pub struct DimeClient {
    stream: WsStream,
}

impl DimeClient {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let (stream, _response) = connect_async(url).await.map_err(|source| BusError::Connect {
            url: url.to_string(),
            source,
        })?;
        log::info!("Connected to DiME at {}", url);

        let mut client = Self { stream };
        client
            .request(
                Command::Handshake {
                    serialization: Serialization::DimeJson,
                    tls: false,
                },
                Vec::new(),
            )
            .await?;
        Ok(client)
    }

    async fn send_frame(&mut self, command: &Command, payload: Vec<u8>) -> Result<(), BusError> {
        let bytes = Frame::new(command, payload)?.encode()?;
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Frame, BusError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::decode(&bytes)?),
                Some(Ok(Message::Close(_))) | None => return Err(BusError::Closed),
                Some(Ok(Message::Text(text))) => {
                    log::warn!("Ignoring text message from DiME ({} bytes)", text.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BusError::WebSocket(e)),
            }
        }
    }

    async fn recv_reply(&mut self, command: &'static str) -> Result<(Reply, Vec<u8>), BusError> {
        let frame = self.recv_frame().await?;
        let reply = frame.reply()?;
        if reply.is_error() {
            return Err(BusError::Server {
                command: command.to_string(),
                message: reply
                    .error
                    .unwrap_or_else(|| format!("status {}", reply.status)),
            });
        }
        Ok((reply, frame.payload))
    }

    /// Send a command and expect a single `status: 0` reply.
    async fn request(&mut self, command: Command, payload: Vec<u8>) -> Result<Reply, BusError> {
        let label = command.label();
        self.send_frame(&command, payload).await?;
        let (reply, _) = self.recv_reply(label).await?;
        if reply.status != Reply::DONE {
            return Err(BusError::UnexpectedReply {
                command: label.to_string(),
                detail: format!("status {}", reply.status),
            });
        }
        Ok(reply)
    }
}

impl Bus for DimeClient {
    async fn join(&mut self, names: &[String]) -> Result<(), BusError> {
        self.request(
            Command::Join {
                name: names.to_vec(),
            },
            Vec::new(),
        )
        .await?;
        log::info!("Joined DiME groups {:?}", names);
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), BusError> {
        self.request(Command::Wait, Vec::new()).await?;
        Ok(())
    }

    async fn sync_r(&mut self, n: usize) -> Result<KvPairs, BusError> {
        let command = Command::Sync { n };
        let label = command.label();
        self.send_frame(&command, Vec::new()).await?;

        // Items are read up to the terminating reply even when some of them
        // are unusable, so the next request sees its own reply.
        let mut pairs = KvPairs::new();
        loop {
            let (reply, payload) = self.recv_reply(label).await?;
            match reply.status {
                Reply::DONE => return Ok(pairs),
                Reply::ITEM => match (reply.varname, decode_value(&payload)) {
                    (Some(name), Ok(value)) => pairs.push((name, value)),
                    (None, _) => log::warn!("Skipping DiME data frame without varname"),
                    (Some(name), Err(e)) => log::warn!("Skipping '{}' from DiME: {}", name, e),
                },
                status => {
                    return Err(BusError::UnexpectedReply {
                        command: label.to_string(),
                        detail: format!("status {}", status),
                    });
                }
            }
        }
    }

    async fn send_r(&mut self, destination: &str, mapping: KvPairs) -> Result<(), BusError> {
        for (varname, value) in mapping {
            let payload = encode_value(&value)?;
            self.request(
                Command::Send {
                    name: destination.to_string(),
                    varname,
                    serialization: Serialization::DimeJson,
                },
                payload,
            )
            .await?;
        }
        Ok(())
    }

    async fn devices(&mut self) -> Result<Vec<String>, BusError> {
        let reply = self.request(Command::Devices, Vec::new()).await?;
        Ok(reply.devices.unwrap_or_default())
    }
}
