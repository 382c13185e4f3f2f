//! In-process MQTT 3.1.1 server for session tests
//!
//! Speaks just enough of the protocol for a rumqttc client: CONNACK, SUBACK,
//! PINGRESP and QoS 0 PUBLISH in both directions. Every publish injected by a
//! test goes to every open connection, subscribed or not.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
enum Command {
    Publish { topic: String, payload: Vec<u8> },
    DropConnections,
}

#[derive(Default)]
struct Recorded {
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, String)>>,
    connects: AtomicUsize,
}

type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

pub struct FakeServer {
    port: u16,
    recorded: Arc<Recorded>,
    commands: broadcast::Sender<Command>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let recorded = Arc::new(Recorded::default());
        let (commands, _) = broadcast::channel(64);

        let task = tokio::spawn(accept_loop(listener, recorded.clone(), commands.clone()));
        Self {
            port,
            recorded,
            commands,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every topic filter received so far, across all connections, in order
    pub fn subscriptions(&self) -> Vec<String> {
        self.recorded.subscriptions.lock().unwrap().clone()
    }

    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions().iter().filter(|t| *t == topic).count()
    }

    /// Publishes received from clients as (topic, payload)
    pub fn published(&self) -> Vec<(String, String)> {
        self.recorded.published.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.recorded.connects.load(Ordering::SeqCst)
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let _ = self.commands.send(Command::Publish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// Closes every open connection from the server side
    pub fn drop_connections(&self) {
        let _ = self.commands.send(Command::DropConnections);
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls `condition` every 20 ms and panics after 5 s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached within 5s");
}

async fn accept_loop(
    listener: TcpListener,
    recorded: Arc<Recorded>,
    commands: broadcast::Sender<Command>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(serve(stream, recorded.clone(), commands.subscribe()));
    }
}

async fn serve(
    stream: TcpStream,
    recorded: Arc<Recorded>,
    mut commands: broadcast::Receiver<Command>,
) {
    let (reader, writer) = stream.into_split();
    let writer: Writer = Arc::new(tokio::sync::Mutex::new(writer));
    let mut reading = tokio::spawn(read_packets(reader, recorded, writer.clone()));

    loop {
        tokio::select! {
            _ = &mut reading => break,
            command = commands.recv() => match command {
                Ok(Command::Publish { topic, payload }) => {
                    let packet = publish_packet(&topic, &payload);
                    if writer.lock().await.write_all(&packet).await.is_err() {
                        break;
                    }
                }
                Ok(Command::DropConnections) | Err(broadcast::error::RecvError::Closed) => {
                    reading.abort();
                    let _ = writer.lock().await.shutdown().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
}

async fn read_packets(
    mut reader: OwnedReadHalf,
    recorded: Arc<Recorded>,
    writer: Writer,
) -> io::Result<()> {
    loop {
        let header = reader.read_u8().await?;
        let length = read_remaining_length(&mut reader).await?;
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await?;

        let reply = match header & 0xF0 {
            0x10 => {
                recorded.connects.fetch_add(1, Ordering::SeqCst);
                Some(vec![0x20, 0x02, 0x00, 0x00])
            }
            0x80 => Some(suback(&body, &recorded)),
            0x30 => {
                record_publish(header, &body, &recorded);
                None
            }
            0xC0 => Some(vec![0xD0, 0x00]),
            0xE0 => return Ok(()),
            _ => None,
        };

        if let Some(reply) = reply {
            writer.lock().await.write_all(&reply).await?;
        }
    }
}

async fn read_remaining_length(reader: &mut OwnedReadHalf) -> io::Result<usize> {
    let mut length = 0usize;
    for shift in [0, 7, 14, 21] {
        let byte = reader.read_u8().await?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(length);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "malformed remaining length",
    ))
}

fn encode_length(mut length: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if length == 0 {
            break;
        }
    }
}

fn read_string(bytes: &[u8]) -> (String, &[u8]) {
    let len = usize::from(u16::from_be_bytes([bytes[0], bytes[1]]));
    let text = String::from_utf8_lossy(&bytes[2..2 + len]).into_owned();
    (text, &bytes[2 + len..])
}

// SUBSCRIBE body: packet id, then (topic, requested qos) pairs
fn suback(body: &[u8], recorded: &Recorded) -> Vec<u8> {
    let mut topics = Vec::new();
    let mut rest = &body[2..];
    while rest.len() >= 2 {
        let (topic, tail) = read_string(rest);
        topics.push(topic);
        rest = &tail[1..];
    }

    let count = topics.len();
    recorded.subscriptions.lock().unwrap().extend(topics);

    let mut packet = vec![0x90];
    encode_length(2 + count, &mut packet);
    packet.extend_from_slice(&body[..2]);
    packet.extend(std::iter::repeat(0x00).take(count));
    packet
}

fn record_publish(header: u8, body: &[u8], recorded: &Recorded) {
    let (topic, rest) = read_string(body);
    let qos = (header >> 1) & 0x03;
    let payload = if qos > 0 { &rest[2..] } else { rest };
    recorded
        .published
        .lock()
        .unwrap()
        .push((topic, String::from_utf8_lossy(payload).into_owned()));
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x30];
    encode_length(2 + topic.len() + payload.len(), &mut packet);
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_uses_continuation_bytes() {
        let mut short = Vec::new();
        let mut long = Vec::new();

        encode_length(2, &mut short);
        encode_length(321, &mut long);

        assert_eq!(short, vec![0x02]);
        assert_eq!(long, vec![0xC1, 0x02]);
    }
}
