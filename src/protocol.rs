//! TCP protocol for camera node ↔ aggregator ↔ downstream consumer.
//!
//! Length-delimited frames carrying bincode payloads.

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use nalgebra::Point3;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::geometry::Ray;
use crate::skeleton::JOINT_COUNT;

// --- Message types ---

/// Operator commands; any connected node may send them.
///
/// The aggregator acts on its own commands and relays the camera ones.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start recording every processed frame
    SaveRays,
    /// Re-run the anatomical match on the next frame
    MatchSkeleton,
    StartDebugging,
    StopDebugging,
    /// Stop the aggregator and every camera
    Stop,
    // Camera commands, relayed to every camera unchanged
    EstimatePose,
    SendGrayscale,
    SendBinarized,
    SaveFramesToFile,
    BinarizationThreshold(u8),
    NoFrames,
}

/// Camera → aggregator
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CameraMessage {
    Hello { identity: String, frame_width: u16, frame_height: u16 },
    /// This camera's rays for the current cycle. Empty when nothing was seen.
    Rays { rays: Vec<Ray> },
    Command(Command),
}

/// Aggregator → camera
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AggregatorMessage {
    Welcome { slot: u16 },
    /// Capture the next frame and report its rays
    GrabFrame,
    Command(Command),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SkeletonUpdate {
    pub cycle: u64,
    pub matched: bool,
    /// Indexed by `JointId`
    pub points: [Point3<f32>; JOINT_COUNT],
}

/// Aggregator → downstream
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DownstreamMessage {
    Skeleton(SkeletonUpdate),
    PointCloud { cycle: u64, high: Vec<Point3<f32>>, low: Vec<Point3<f32>> },
}

// --- TCP codec helpers ---

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;
pub type MessageSink = SplitSink<MessageStream, Bytes>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(16 * 1024 * 1024) // 16MB
        .new_codec();
    Framed::new(stream, codec)
}

pub fn encode<T: Serialize>(msg: &T) -> anyhow::Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(msg)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T: Serialize>(
    stream: &mut MessageStream,
    msg: &T,
) -> anyhow::Result<()> {
    stream.send(encode(msg)?).await?;
    Ok(())
}

/// Same as [`send_message`] for the write half of a split stream.
pub async fn send_to_sink<T: Serialize>(
    sink: &mut MessageSink,
    msg: &T,
) -> anyhow::Result<()> {
    sink.send(encode(msg)?).await?;
    Ok(())
}

/// Receive and deserialize a message.
pub async fn recv_message<T: DeserializeOwned>(
    stream: &mut MessageStream,
) -> anyhow::Result<T> {
    match stream.next().await {
        Some(Ok(bytes)) => decode(&bytes),
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow::anyhow!("connection closed")),
    }
}
