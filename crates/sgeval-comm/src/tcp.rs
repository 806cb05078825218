use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::{check_rank, CommError, Collective, Gatherable};

/// Largest frame a rank accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;
const CONNECT_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    rank: usize,
    world_size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Welcome {
    accepted: bool,
    reason: Option<String>,
}

enum Role {
    /// Rank 0. Peer streams are stored in rank order (index 0 is rank 1).
    Host { peers: Mutex<Vec<TcpStream>> },
    Peer { stream: Mutex<TcpStream> },
}

/// Multi-process group over TCP with rank 0 acting as the hub.
///
/// Each all-gather is one round trip: every peer sends its encoded value to
/// rank 0, which answers everyone with the rank-ordered list of all values.
/// Values are bincode-encoded, so non-finite floats travel unchanged.
///
/// The handle owns a small tokio runtime and blocks on it, so it must not be
/// used from inside another async runtime.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    max_frame_bytes: usize,
    // Streams must drop before the runtime that registered them.
    role: Role,
    runtime: Runtime,
}

impl std::fmt::Debug for TcpCollective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpCollective")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish()
    }
}

impl TcpCollective {
    /// Rank 0: accepts `world_size - 1` peers on `listener`.
    pub fn host(listener: StdTcpListener, world_size: usize) -> Result<Self, CommError> {
        check_rank(0, world_size)?;
        let runtime = build_runtime()?;
        listener.set_nonblocking(true)?;

        info!(
            target: "sgeval_comm",
            rank = 0usize,
            world_size = world_size,
            addr = %listener.local_addr()?,
            "waiting for peers"
        );

        let peers = runtime.block_on(accept_peers(listener, world_size, DEFAULT_MAX_FRAME_BYTES))?;
        Ok(Self {
            rank: 0,
            world_size,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            role: Role::Host {
                peers: Mutex::new(peers),
            },
            runtime,
        })
    }

    /// Ranks 1..world_size: connects to the host, retrying until `connect_timeout`.
    pub fn join(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        connect_timeout: Duration,
    ) -> Result<Self, CommError> {
        check_rank(rank, world_size)?;
        if rank == 0 {
            return Err(CommError::Protocol(
                "rank 0 must host, not join".to_string(),
            ));
        }

        let runtime = build_runtime()?;
        let stream = runtime.block_on(connect_and_greet(
            addr,
            Hello { rank, world_size },
            connect_timeout,
            DEFAULT_MAX_FRAME_BYTES,
        ))?;
        Ok(Self {
            rank,
            world_size,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            role: Role::Peer {
                stream: Mutex::new(stream),
            },
            runtime,
        })
    }

    /// Caps the size of every frame this rank sends or accepts.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(()).map(|_| ())
    }

    fn all_gather<T: Gatherable>(&self, value: T) -> Result<Vec<T>, CommError> {
        let own = encode(&value)?;
        let max = self.max_frame_bytes;

        let frames: Vec<Vec<u8>> = match &self.role {
            Role::Host { peers } => {
                let mut peers = peers.lock().map_err(|_| CommError::Poisoned)?;
                self.runtime.block_on(async {
                    let mut frames = Vec::with_capacity(self.world_size);
                    frames.push(own);
                    for stream in peers.iter_mut() {
                        frames.push(read_frame(stream, max).await?);
                    }
                    let combined = encode(&frames)?;
                    for stream in peers.iter_mut() {
                        write_frame(stream, &combined, max).await?;
                    }
                    Ok::<_, CommError>(frames)
                })?
            }
            Role::Peer { stream } => {
                let mut stream = stream.lock().map_err(|_| CommError::Poisoned)?;
                self.runtime.block_on(async {
                    write_frame(&mut stream, &own, max).await?;
                    decode(&read_frame(&mut stream, max).await?)
                })?
            }
        };

        if frames.len() != self.world_size {
            return Err(CommError::Protocol(format!(
                "gathered {} values for world_size {}",
                frames.len(),
                self.world_size
            )));
        }
        frames.iter().map(|frame| decode(frame)).collect()
    }
}

fn build_runtime() -> Result<Runtime, CommError> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

async fn accept_peers(
    listener: StdTcpListener,
    world_size: usize,
    max_frame_bytes: usize,
) -> Result<Vec<TcpStream>, CommError> {
    let listener = TcpListener::from_std(listener)?;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();

    let mut joined = 0usize;
    while joined + 1 < world_size {
        let (mut stream, remote) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let hello: Hello = decode(&read_frame(&mut stream, max_frame_bytes).await?)?;

        let rejection = if hello.world_size != world_size {
            Some(format!(
                "world_size mismatch: host has {world_size}, peer has {}",
                hello.world_size
            ))
        } else if hello.rank == 0 || hello.rank >= world_size {
            Some(format!("rank {} is not a valid peer rank", hello.rank))
        } else if slots[hello.rank - 1].is_some() {
            Some(format!("rank {} already joined", hello.rank))
        } else {
            None
        };

        let welcome = Welcome {
            accepted: rejection.is_none(),
            reason: rejection.clone(),
        };
        write_frame(&mut stream, &encode(&welcome)?, max_frame_bytes).await?;
        if let Some(reason) = rejection {
            return Err(CommError::Protocol(reason));
        }

        debug!(target: "sgeval_comm", peer_rank = hello.rank, remote = %remote, "peer joined");
        slots[hello.rank - 1] = Some(stream);
        joined += 1;
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| CommError::Protocol("peer table incomplete".to_string()))
}

async fn connect_and_greet(
    addr: SocketAddr,
    hello: Hello,
    connect_timeout: Duration,
    max_frame_bytes: usize,
) -> Result<TcpStream, CommError> {
    let started = Instant::now();
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(_) if started.elapsed() < connect_timeout => {
                tokio::time::sleep(CONNECT_RETRY).await;
            }
            Err(_) => {
                return Err(CommError::ConnectTimeout {
                    addr: addr.to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    };
    stream.set_nodelay(true)?;

    write_frame(&mut stream, &encode(&hello)?, max_frame_bytes).await?;
    let welcome: Welcome = decode(&read_frame(&mut stream, max_frame_bytes).await?)?;
    if !welcome.accepted {
        return Err(CommError::Protocol(
            welcome
                .reason
                .unwrap_or_else(|| "rejected by host".to_string()),
        ));
    }
    Ok(stream)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Big-endian `u32` length, then the payload.
async fn write_frame(stream: &mut TcpStream, bytes: &[u8], max: usize) -> Result<(), CommError> {
    if bytes.len() > max.min(u32::MAX as usize) {
        return Err(CommError::FrameTooLarge(bytes.len()));
    }
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Rejects a declared length above `max` before allocating for it.
async fn read_frame(stream: &mut TcpStream, max: usize) -> Result<Vec<u8>, CommError> {
    let len = stream.read_u32().await? as usize;
    if len > max {
        return Err(CommError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_and_respect_the_limit() {
        let runtime = build_runtime().unwrap();
        runtime.block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut client = TcpStream::connect(addr).await.unwrap();
            let (mut server, _) = listener.accept().await.unwrap();

            write_frame(&mut client, b"hello", 16).await.unwrap();
            assert_eq!(read_frame(&mut server, 16).await.unwrap(), b"hello".to_vec());

            assert!(matches!(
                write_frame(&mut client, &[0u8; 17], 16).await,
                Err(CommError::FrameTooLarge(17))
            ));

            // A declared length above the limit is refused before the body is read.
            client.write_u32(1 << 30).await.unwrap();
            assert!(matches!(
                read_frame(&mut server, 16).await,
                Err(CommError::FrameTooLarge(len)) if len == 1 << 30
            ));
        });
    }

    #[test]
    fn codec_keeps_non_finite_floats() {
        let values = vec![f32::NAN, f32::INFINITY, -0.0];
        let back: Vec<f32> = decode(&encode(&values).unwrap()).unwrap();
        assert!(back[0].is_nan());
        assert_eq!(back[1], f32::INFINITY);
        assert_eq!(back[2].to_bits(), (-0.0f32).to_bits());
    }
}
