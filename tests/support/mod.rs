//! In-process line backends for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use line_dispatch::BackendAddress;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// How a test backend answers each request line.
#[derive(Clone)]
pub enum Behavior {
    /// PING -> PONG, SET k v -> OK, GET k -> VALUE v / NOT_FOUND
    KeyValue(Arc<Mutex<HashMap<String, String>>>),
    /// Reads requests, never answers
    Silent,
    /// Reads one request, then closes without answering
    Close,
    /// Answers every request with the same bytes
    Fixed(&'static [u8]),
}

impl Behavior {
    pub fn key_value() -> Self {
        Behavior::KeyValue(Arc::new(Mutex::new(HashMap::new())))
    }
}

/// A running backend and its connection counters.
pub struct TestBackend {
    pub address: BackendAddress,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl TestBackend {
    pub async fn spawn(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string().parse().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));

        let (accepted_c, open_c) = (Arc::clone(&accepted), Arc::clone(&open));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepted_c.fetch_add(1, Ordering::SeqCst);
                open_c.fetch_add(1, Ordering::SeqCst);

                let behavior = behavior.clone();
                let open = Arc::clone(&open_c);
                tokio::spawn(async move {
                    let _ = serve(stream, behavior).await;
                    open.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        TestBackend {
            address,
            accepted,
            open,
        }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait until every accepted connection has been closed by the peer.
    pub async fn wait_idle(&self) {
        for _ in 0..200 {
            if self.open.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "backend {} still has {} open connections",
            self.address,
            self.open.load(Ordering::SeqCst)
        );
    }
}

/// An address with nothing listening on it.
pub fn dead_address() -> BackendAddress {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string().parse().unwrap()
}

async fn serve(stream: TcpStream, behavior: Behavior) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        match &behavior {
            Behavior::Silent => continue,
            Behavior::Close => return Ok(()),
            Behavior::Fixed(reply) => writer.write_all(reply).await?,
            Behavior::KeyValue(store) => {
                let reply = key_value_reply(line.trim_end(), store);
                writer.write_all(reply.as_bytes()).await?;
            }
        }
    }
}

fn key_value_reply(line: &str, store: &Mutex<HashMap<String, String>>) -> String {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(cmd), None, None) if cmd.eq_ignore_ascii_case("PING") => "PONG\n".to_string(),
        (Some(cmd), Some(key), Some(value)) if cmd.eq_ignore_ascii_case("SET") => {
            store.lock().unwrap().insert(key.to_string(), value.to_string());
            "OK\n".to_string()
        }
        (Some(cmd), Some(key), None) if cmd.eq_ignore_ascii_case("GET") => {
            match store.lock().unwrap().get(key) {
                Some(value) => format!("VALUE {}\n", value),
                None => "NOT_FOUND\n".to_string(),
            }
        }
        _ => "ERROR unknown command\n".to_string(),
    }
}
