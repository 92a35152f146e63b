//! Control socket client

use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use vmexpire_api::{Command, Event, Request, Response, ResponsePayload, ResponseResult};
use vmexpire_util::ClientId;

use crate::{IpcError, IpcResult};

/// Client for the vmexpired control socket
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_request_id: u64,
}

impl IpcClient {
    pub async fn connect(socket_path: impl AsRef<Path>) -> IpcResult<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            next_request_id: 1,
        })
    }

    /// Send a command and wait for its response
    pub async fn send(&mut self, command: Command) -> IpcResult<Response> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let request = Request::new(request_id, command);
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;

        let line = read_line(&mut self.reader).await?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Like [`send`](Self::send), with protocol errors turned into `ServerError`
    pub async fn call(&mut self, command: Command) -> IpcResult<ResponsePayload> {
        match self.send(command).await?.result {
            ResponseResult::Ok(payload) => Ok(payload),
            ResponseResult::Err(e) => Err(IpcError::ServerError(e.message)),
        }
    }

    /// Subscribe and turn this client into an event stream
    pub async fn subscribe(mut self) -> IpcResult<EventStream> {
        let client_id = match self.call(Command::SubscribeEvents).await? {
            ResponsePayload::Subscribed { client_id } => client_id,
            other => {
                return Err(IpcError::ServerError(format!(
                    "Unexpected subscribe response: {:?}",
                    other
                )));
            }
        };

        Ok(EventStream {
            client_id,
            reader: self.reader,
            _writer: self.writer,
        })
    }
}

/// Events pushed by vmexpired to a subscribed client
pub struct EventStream {
    client_id: ClientId,
    reader: BufReader<OwnedReadHalf>,
    // Held so the server does not see the connection as half-closed
    _writer: OwnedWriteHalf,
}

impl EventStream {
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub async fn next(&mut self) -> IpcResult<Event> {
        let line = read_line(&mut self.reader).await?;
        Ok(serde_json::from_str(&line)?)
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> IpcResult<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(IpcError::ConnectionClosed);
    }
    Ok(line.trim().to_string())
}
