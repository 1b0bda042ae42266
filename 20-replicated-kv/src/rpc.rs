//! Wire protocol for clients: JSON lines over TCP.
//!
//! Every request is one JSON object on its own line, tagged by `type`, and
//! gets exactly one reply line. Line framing keeps the protocol usable from
//! netcat.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::{select, sync::watch};
use tracing::{debug, info, warn};

use crate::error::{KvError, OK};
use crate::runtime::{NodeHandle, NodeRole, NodeStatus};
use crate::service::{GetArgs, GetReply, KvService, PutArgs, PutReply};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest request or reply line accepted, newline included.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("line longer than {MAX_LINE_LEN} bytes")]
struct LineTooLong;

fn is_line_too_long(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<LineTooLong>())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Put { key: String, value: String },
    Get { key: String },
    AddMember { id: u64, address: String },
    RemoveMember { id: u64 },
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Put(PutReply),
    Get(GetReply),
    Member(MemberReply),
    Status(StatusReply),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberReply {
    pub err: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReply {
    pub id: u64,
    pub role: String,
    pub leader_id: Option<u64>,
    pub term: u64,
    pub read_index: Option<u64>,
    pub available: bool,
}

impl From<NodeStatus> for StatusReply {
    fn from(status: NodeStatus) -> Self {
        Self {
            id: status.id,
            role: format!("{:?}", status.role),
            leader_id: status.leader_id,
            term: status.term,
            read_index: status.read_index,
            available: status.available,
        }
    }
}

/// Reads the next non-empty line and decodes it.
///
/// Lines over [`MAX_LINE_LEN`] fail with `InvalidData`; the rest of such a
/// line is left unread, so the stream is no longer framed.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > MAX_LINE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, LineTooLong));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Serves the front-end to clients. Handlers run on the blocking pool.
pub struct RpcServer {
    listener: TcpListener,
    service: KvService,
    admin: Option<NodeHandle>,
}

impl RpcServer {
    pub fn new(listener: TcpListener, service: KvService) -> Self {
        Self {
            listener,
            service,
            admin: None,
        }
    }

    /// Enables `add_member` / `remove_member` through `node`.
    pub fn with_admin(mut self, node: NodeHandle) -> Self {
        self.admin = Some(node);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer {
            listener,
            service,
            admin,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("rpc server shutting down");
                    let _ = stop_tx.send(true);
                    break;
                }
                accept_result = listener.accept() => match accept_result {
                    Ok((stream, peer)) => {
                        let handler = Handler {
                            service: service.clone(),
                            admin: admin.clone(),
                        };
                        let stop = stop_rx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handler.serve(stream, stop).await {
                                warn!(peer = %peer, error = ?err, "client connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[derive(Clone)]
struct Handler {
    service: KvService,
    admin: Option<NodeHandle>,
}

impl Handler {
    async fn serve(self, stream: TcpStream, mut stop: watch::Receiver<bool>) -> Result<()> {
        let peer = stream.peer_addr().ok();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        debug!(?peer, "client connected");

        loop {
            let request = select! {
                _ = stop.changed() => break,
                request = read_message::<_, Request>(&mut reader) => request,
            };
            let response = match request {
                Ok(Some(request)) => self.dispatch(request).await?,
                Ok(None) => break,
                Err(err) if is_line_too_long(&err) => {
                    warn!(?peer, "request line too long, closing connection");
                    let reply = Response::Error {
                        message: format!("malformed request: {err}"),
                    };
                    let _ = write_message(&mut writer, &reply).await;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => Response::Error {
                    message: format!("malformed request: {err}"),
                },
                Err(err) => return Err(err.into()),
            };
            write_message(&mut writer, &response).await?;
        }

        debug!(?peer, "client disconnected");
        Ok(())
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        let handler = self.clone();
        let response = tokio::task::spawn_blocking(move || handler.handle(request))
            .await
            .context("rpc handler panicked")?;
        Ok(response)
    }

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Put { key, value } => {
                Response::Put(self.service.handle_put(PutArgs { key, value }))
            }
            Request::Get { key } => Response::Get(self.service.handle_get(GetArgs { key })),
            Request::AddMember { id, address } => {
                Response::Member(self.membership(|node| node.add_member(id, address)))
            }
            Request::RemoveMember { id } => {
                Response::Member(self.membership(|node| node.remove_member(id)))
            }
            Request::Status => Response::Status(self.service.status().into()),
        }
    }

    fn membership(&self, change: impl FnOnce(&NodeHandle) -> Result<()>) -> MemberReply {
        let status = self.service.status();
        let refuse = |err: KvError, message: String| MemberReply {
            leader: match &err {
                KvError::NotLeader { leader } => *leader,
                _ => None,
            },
            err: err.code().to_string(),
            message,
        };

        let Some(node) = &self.admin else {
            return refuse(KvError::Unavailable, "membership changes disabled".to_string());
        };
        if !status.available {
            return refuse(KvError::Unavailable, String::new());
        }
        if status.role != NodeRole::Leader {
            return refuse(
                KvError::NotLeader {
                    leader: status.leader_id,
                },
                String::new(),
            );
        }
        match change(node) {
            Ok(()) => MemberReply {
                err: OK.to_string(),
                leader: None,
                message: String::new(),
            },
            Err(err) => refuse(KvError::InvalidArgument("rejected"), format!("{err:#}")),
        }
    }
}

/// Async client for [`RpcServer`]. One request in flight at a time.
pub struct RpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RpcClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to kv server")?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.writer, request).await?;
        match read_message(&mut self.reader).await? {
            Some(Response::Error { message }) => bail!("server error: {message}"),
            Some(response) => Ok(response),
            None => bail!("server closed the connection"),
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<PutReply> {
        match self
            .call(&Request::Put {
                key: key.to_string(),
                value: value.to_string(),
            })
            .await?
        {
            Response::Put(reply) => Ok(reply),
            other => bail!("unexpected reply to put: {other:?}"),
        }
    }

    pub async fn get(&mut self, key: &str) -> Result<GetReply> {
        match self.call(&Request::Get { key: key.to_string() }).await? {
            Response::Get(reply) => Ok(reply),
            other => bail!("unexpected reply to get: {other:?}"),
        }
    }

    pub async fn add_member(&mut self, id: u64, address: &str) -> Result<MemberReply> {
        match self
            .call(&Request::AddMember {
                id,
                address: address.to_string(),
            })
            .await?
        {
            Response::Member(reply) => Ok(reply),
            other => bail!("unexpected reply to add_member: {other:?}"),
        }
    }

    pub async fn remove_member(&mut self, id: u64) -> Result<MemberReply> {
        match self.call(&Request::RemoveMember { id }).await? {
            Response::Member(reply) => Ok(reply),
            other => bail!("unexpected reply to remove_member: {other:?}"),
        }
    }

    pub async fn status(&mut self) -> Result<StatusReply> {
        match self.call(&Request::Status).await? {
            Response::Status(reply) => Ok(reply),
            other => bail!("unexpected reply to status: {other:?}"),
        }
    }
}
