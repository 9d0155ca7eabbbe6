//! Real TCP transport (§4.5): one connection per peer pair, a nonblocking
//! event loop supplied by `tokio::net`. Ranks below ours are dialed;
//! connections from ranks above ours are accepted and identified by a
//! one-shot rank handshake.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::err::{Error, Result};

use super::Transport;

pub struct TcpTransport {
	rank: usize,
	num_workers: usize,
	reads: Vec<Option<Mutex<OwnedReadHalf>>>,
	writes: Vec<Option<Mutex<OwnedWriteHalf>>>,
}

impl TcpTransport {
	/// Establishes the full mesh given every worker's listen address. Blocks
	/// until every connection in the mesh is up.
	pub async fn connect(rank: usize, addrs: Vec<SocketAddr>) -> Result<Self> {
		let n = addrs.len();
		let listener = TcpListener::bind(addrs[rank]).await?;

		let accept_count = n - rank - 1;
		let acceptor = tokio::spawn(async move {
			let mut accepted = Vec::with_capacity(accept_count);
			for _ in 0..accept_count {
				let (mut stream, _) = listener.accept().await?;
				let their_rank = stream.read_u64().await? as usize;
				accepted.push((their_rank, stream));
			}
			Ok::<_, std::io::Error>(accepted)
		});

		let mut dialed = Vec::with_capacity(rank);
		for peer in 0..rank {
			let stream = loop {
				match TcpStream::connect(addrs[peer]).await {
					Ok(s) => break s,
					Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
				}
			};
			let mut stream = stream;
			stream.write_u64(rank as u64).await?;
			dialed.push((peer, stream));
		}

		let accepted = acceptor.await.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

		let mut streams: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();
		for (peer, stream) in dialed {
			streams[peer] = Some(stream);
		}
		for (peer, stream) in accepted {
			streams[peer] = Some(stream);
		}

		let mut reads = Vec::with_capacity(n);
		let mut writes = Vec::with_capacity(n);
		for (peer, slot) in streams.into_iter().enumerate() {
			if peer == rank {
				reads.push(None);
				writes.push(None);
				continue;
			}
			let stream = slot.expect("mesh connection missing after handshake");
			stream.set_nodelay(true).ok();
			let (r, w) = stream.into_split();
			reads.push(Some(Mutex::new(r)));
			writes.push(Some(Mutex::new(w)));
		}

		Ok(Self {
			rank,
			num_workers: n,
			reads,
			writes,
		})
	}
}

#[async_trait]
impl Transport for TcpTransport {
	fn rank(&self) -> usize {
		self.rank
	}

	fn num_workers(&self) -> usize {
		self.num_workers
	}

	async fn send(&self, peer: usize, data: Vec<u8>) -> Result<()> {
		let mutex = self.writes[peer].as_ref().expect("no write half for peer");
		let mut w = mutex.lock().await;
		w.write_u64(data.len() as u64).await?;
		w.write_all(&data).await?;
		Ok(())
	}

	async fn recv(&self, peer: usize) -> Result<Vec<u8>> {
		let mutex = self.reads[peer].as_ref().expect("no read half for peer");
		let mut r = mutex.lock().await;
		let len = r.read_u64().await.map_err(|e| Error::PeerDisconnected {
			peer,
			reason: e.to_string(),
		})? as usize;
		let mut buf = vec![0u8; len];
		r.read_exact(&mut buf).await?;
		Ok(buf)
	}
}
