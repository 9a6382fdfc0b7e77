use arrayref::{array_ref, array_refs};
use byteorder::{ByteOrder, LittleEndian};
use rkyv::{Archive, Deserialize, Serialize};

use super::{error::Error, Frame, Frames};

/// Wire protocol revision spoken by this crate. Revision 2 carries a
/// per-photon flags array, giving 13 PHOTONDATA data blocks. Earlier
/// revisions are not negotiated and are rejected as malformed.
pub const WIRE_VERSION: u8 = 2;

/// Data blocks following the PHOTONDATA tag: metadata, 11 float arrays
/// and the flags array.
pub const PHOTONDATA_BLOCKS: usize = 13;

/// The empty frame separating a routing envelope from the message body.
pub const DELIMITER: &[u8] = b"";

/// Message kinds. Every kind travels as a fixed byte tag in the first body
/// frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    // CONTROL
    Ready,
    Heartbeat,
    Ping,
    Ack,
    // SESSION
    RunBegin,
    RunEnd,
    // DATA
    PhotonData,
    DetectorInfo,
    // OUTCOME
    SimComplete,
    SimCompleteAsync,
    SimFailed,
    NoWorkers,
    UnknownRequest,
}

impl MessageKind {
    const ALL: [MessageKind; 13] = [
        MessageKind::Ready,
        MessageKind::Heartbeat,
        MessageKind::Ping,
        MessageKind::Ack,
        MessageKind::RunBegin,
        MessageKind::RunEnd,
        MessageKind::PhotonData,
        MessageKind::DetectorInfo,
        MessageKind::SimComplete,
        MessageKind::SimCompleteAsync,
        MessageKind::SimFailed,
        MessageKind::NoWorkers,
        MessageKind::UnknownRequest,
    ];

    pub fn tag(self) -> &'static [u8] {
        match self {
            MessageKind::Ready => b"\x01",
            MessageKind::Heartbeat => b"\x02",
            MessageKind::Ping => b"PING",
            MessageKind::Ack => b"ACK",
            MessageKind::RunBegin => b"RUN_BEGIN",
            MessageKind::RunEnd => b"RUN_END",
            MessageKind::PhotonData => b"PHOTONDATA",
            MessageKind::DetectorInfo => b"DETECTOR_INFO",
            MessageKind::SimComplete => b"SIM_COMPLETE",
            MessageKind::SimCompleteAsync => b"SIM_COMPLETE_ASYNC",
            MessageKind::SimFailed => b"SIM_FAILED",
            MessageKind::NoWorkers => b"NO_WORKERS",
            MessageKind::UnknownRequest => b"UNKNOWN_REQUEST",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    pub fn frame(self) -> Frame {
        self.tag().to_vec()
    }

    /// True if `frame` is exactly this kind's tag.
    pub fn is(self, frame: &[u8]) -> bool {
        self.tag() == frame
    }
}

/// Checks that `frames` opens with `kind` and holds at least `min_frames`
/// frames (tag included). Returns the frames after the tag.
pub fn expect_kind(
    frames: &[Frame],
    kind: MessageKind,
    min_frames: usize,
) -> Result<&[Frame], Error> {
    let first = frames
        .first()
        .ok_or_else(|| Error::malformed("empty message"))?;
    if !kind.is(first) {
        return Err(Error::malformed(format!(
            "expected {:?}, got tag {:?}",
            kind,
            String::from_utf8_lossy(first)
        )));
    }
    if frames.len() < min_frames {
        return Err(Error::malformed(format!(
            "{:?} needs at least {} frames, got {}",
            kind,
            min_frames,
            frames.len()
        )));
    }
    Ok(&frames[1..])
}

/// How a received message is addressed.
#[derive(Debug, PartialEq, Eq)]
pub enum Envelope<'a> {
    /// `[return_address, "", body..]`, as delivered through the broker.
    Routed {
        return_address: &'a [u8],
        body: &'a [Frame],
    },
    /// A bare body from a directly connected peer.
    Direct { body: &'a [Frame] },
}

/// A message is routed if it has at least two frames and the second is the
/// empty delimiter; anything else is a direct request.
pub fn classify(frames: &[Frame]) -> Envelope<'_> {
    if frames.len() >= 2 && frames[1].is_empty() {
        Envelope::Routed {
            return_address: &frames[0],
            body: &frames[2..],
        }
    } else {
        Envelope::Direct { body: frames }
    }
}

impl<'a> Envelope<'a> {
    pub fn body(&self) -> &'a [Frame] {
        match *self {
            Envelope::Routed { body, .. } => body,
            Envelope::Direct { body } => body,
        }
    }

    /// Addresses a reply the same way the request arrived.
    pub fn wrap(&self, reply: Frames) -> Frames {
        match *self {
            Envelope::Routed { return_address, .. } => {
                let mut frames = Vec::with_capacity(reply.len() + 2);
                frames.push(return_address.to_vec());
                frames.push(DELIMITER.to_vec());
                frames.extend(reply);
                frames
            }
            Envelope::Direct { .. } => reply,
        }
    }
}

fn check_word_aligned(
    block: &[u8],
    field: &'static str,
) -> Result<usize, Error> {
    if block.len() % 4 != 0 {
        return Err(Error::malformed(format!(
            "`{}` block of {} bytes is not a whole number of 4-byte elements",
            field,
            block.len()
        )));
    }
    Ok(block.len() / 4)
}

pub fn read_f32s(block: &[u8], field: &'static str) -> Result<Vec<f32>, Error> {
    let mut out = vec![0f32; check_word_aligned(block, field)?];
    LittleEndian::read_f32_into(block, &mut out);
    Ok(out)
}

pub fn read_u32s(block: &[u8], field: &'static str) -> Result<Vec<u32>, Error> {
    let mut out = vec![0u32; check_word_aligned(block, field)?];
    LittleEndian::read_u32_into(block, &mut out);
    Ok(out)
}

pub fn read_i32s(block: &[u8], field: &'static str) -> Result<Vec<i32>, Error> {
    let mut out = vec![0i32; check_word_aligned(block, field)?];
    LittleEndian::read_i32_into(block, &mut out);
    Ok(out)
}

pub fn f32_frame(values: &[f32]) -> Frame {
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_f32_into(values, &mut out);
    out
}

pub fn u32_frame(values: &[u32]) -> Frame {
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_u32_into(values, &mut out);
    out
}

pub fn i32_frame(values: &[i32]) -> Frame {
    let mut out = vec![0u8; values.len() * 4];
    LittleEndian::write_i32_into(values, &mut out);
    out
}

fn check_len(
    field: &'static str,
    expected: usize,
    actual: usize,
) -> Result<(), Error> {
    if expected != actual {
        return Err(Error::LengthMismatch {
            field,
            expected,
            actual,
        });
    }
    Ok(())
}

fn read_event_id(block: &[u8]) -> Result<u32, Error> {
    if block.len() != 4 {
        return Err(Error::malformed(format!(
            "event id frame has {} bytes, expected 4",
            block.len()
        )));
    }
    Ok(u32::from_le_bytes(*array_ref![block, 0, 4]))
}

/// Names of the float blocks of a PHOTONDATA message, in wire order.
const PHOTON_FLOAT_FIELDS: [&str; 11] = [
    "pos_x",
    "pos_y",
    "pos_z",
    "dir_x",
    "dir_y",
    "dir_z",
    "pol_x",
    "pol_y",
    "pol_z",
    "wavelength",
    "time",
];

/// One simulation request's photons as parallel arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PhotonBatch {
    pub event_id: u32,
    pub pos: [Vec<f32>; 3],
    pub dir: [Vec<f32>; 3],
    pub pol: [Vec<f32>; 3],
    pub wavelength: Vec<f32>,
    pub time: Vec<f32>,
    pub flags: Vec<u32>,
}

impl PhotonBatch {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes a PHOTONDATA body, tag included.
    pub fn decode(body: &[Frame]) -> Result<Self, Error> {
        let blocks =
            expect_kind(body, MessageKind::PhotonData, 1 + PHOTONDATA_BLOCKS)?;
        if blocks.len() != PHOTONDATA_BLOCKS {
            return Err(Error::malformed(format!(
                "wire version {} expects {} PHOTONDATA blocks, got {}",
                WIRE_VERSION,
                PHOTONDATA_BLOCKS,
                blocks.len()
            )));
        }

        let meta = &blocks[0];
        if meta.len() != 8 {
            return Err(Error::malformed(format!(
                "metadata block has {} bytes, expected 8",
                meta.len()
            )));
        }
        let (id, count) = array_refs![array_ref![meta, 0, 8], 4, 4];
        let event_id = u32::from_le_bytes(*id);
        let count = u32::from_le_bytes(*count) as usize;

        let mut floats = Vec::with_capacity(PHOTON_FLOAT_FIELDS.len());
        for (block, field) in blocks[1..12].iter().zip(PHOTON_FLOAT_FIELDS) {
            let values = read_f32s(block, field)?;
            check_len(field, count, values.len())?;
            floats.push(values);
        }
        let flags = read_u32s(&blocks[12], "flags")?;
        check_len("flags", count, flags.len())?;

        let mut floats = floats.into_iter();
        let mut next = || floats.next().unwrap_or_default();
        Ok(PhotonBatch {
            event_id,
            pos: [next(), next(), next()],
            dir: [next(), next(), next()],
            pol: [next(), next(), next()],
            wavelength: next(),
            time: next(),
            flags,
        })
    }

    /// Encodes a PHOTONDATA body, tag included.
    pub fn encode(&self) -> Frames {
        let mut meta = Vec::with_capacity(8);
        meta.extend_from_slice(&self.event_id.to_le_bytes());
        meta.extend_from_slice(&(self.len() as u32).to_le_bytes());

        let mut frames = Vec::with_capacity(1 + PHOTONDATA_BLOCKS);
        frames.push(MessageKind::PhotonData.frame());
        frames.push(meta);
        for axis in self.pos.iter().chain(&self.dir).chain(&self.pol) {
            frames.push(f32_frame(axis));
        }
        frames.push(f32_frame(&self.wavelength));
        frames.push(f32_frame(&self.time));
        frames.push(u32_frame(&self.flags));
        frames
    }
}

/// Detected photoelectrons of one simulated event.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hits {
    pub channel: Vec<u32>,
    pub dir: [Vec<f32>; 3],
    pub pol: [Vec<f32>; 3],
    pub wavelength: Vec<f32>,
    pub time: Vec<f32>,
    pub flags: Vec<u32>,
}

impl Hits {
    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    /// Checks that every hit array has as many entries as `channel`.
    pub fn check(&self) -> Result<(), Error> {
        let n = self.len();
        for (field, len) in [
            ("dir_x", self.dir[0].len()),
            ("dir_y", self.dir[1].len()),
            ("dir_z", self.dir[2].len()),
            ("pol_x", self.pol[0].len()),
            ("pol_y", self.pol[1].len()),
            ("pol_z", self.pol[2].len()),
            ("wavelength", self.wavelength.len()),
            ("time", self.time.len()),
            ("flags", self.flags.len()),
        ] {
            check_len(field, n, len)?;
        }
        Ok(())
    }

    fn encode_into(&self, frames: &mut Frames) {
        frames.push(u32_frame(&self.channel));
        for axis in self.dir.iter().chain(&self.pol) {
            frames.push(f32_frame(axis));
        }
        frames.push(f32_frame(&self.wavelength));
        frames.push(f32_frame(&self.time));
        frames.push(u32_frame(&self.flags));
    }

    fn decode(blocks: &[Frame]) -> Result<Self, Error> {
        if blocks.len() != 10 {
            return Err(Error::malformed(format!(
                "hit payload has {} blocks, expected 10",
                blocks.len()
            )));
        }
        let hits = Hits {
            channel: read_u32s(&blocks[0], "channel")?,
            dir: [
                read_f32s(&blocks[1], "dir_x")?,
                read_f32s(&blocks[2], "dir_y")?,
                read_f32s(&blocks[3], "dir_z")?,
            ],
            pol: [
                read_f32s(&blocks[4], "pol_x")?,
                read_f32s(&blocks[5], "pol_y")?,
                read_f32s(&blocks[6], "pol_z")?,
            ],
            wavelength: read_f32s(&blocks[7], "wavelength")?,
            time: read_f32s(&blocks[8], "time")?,
            flags: read_u32s(&blocks[9], "flags")?,
        };
        hits.check()?;
        Ok(hits)
    }
}

/// Static per-channel detector description.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[archive(check_bytes)]
pub struct DetectorInfo {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub z: Vec<f32>,
    pub channel_type: Vec<i32>,
}

impl DetectorInfo {
    pub fn channels(&self) -> usize {
        self.channel_type.len()
    }
}

/// A decoded request body.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Ping,
    DetectorInfo,
    PhotonData(PhotonBatch),
    RunBegin { name: String },
    RunEnd,
    /// A well-formed message whose tag this worker does not serve.
    Unknown(Frame),
}

impl Request {
    pub fn decode(body: &[Frame]) -> Result<Self, Error> {
        let tag = body
            .first()
            .ok_or_else(|| Error::malformed("empty request body"))?;
        Ok(match MessageKind::from_tag(tag) {
            Some(MessageKind::Ping) => Request::Ping,
            Some(MessageKind::DetectorInfo) => Request::DetectorInfo,
            Some(MessageKind::PhotonData) => {
                Request::PhotonData(PhotonBatch::decode(body)?)
            }
            Some(MessageKind::RunBegin) => {
                let rest = expect_kind(body, MessageKind::RunBegin, 2)?;
                let name = String::from_utf8(rest[0].clone())
                    .map_err(|_| Error::malformed("RUN_BEGIN name not UTF-8"))?;
                Request::RunBegin { name }
            }
            Some(MessageKind::RunEnd) => Request::RunEnd,
            _ => Request::Unknown(tag.clone()),
        })
    }

    pub fn encode(&self) -> Frames {
        match self {
            Request::Ping => vec![MessageKind::Ping.frame()],
            Request::DetectorInfo => vec![MessageKind::DetectorInfo.frame()],
            Request::PhotonData(batch) => batch.encode(),
            Request::RunBegin { name } => {
                vec![MessageKind::RunBegin.frame(), name.as_bytes().to_vec()]
            }
            Request::RunEnd => vec![MessageKind::RunEnd.frame()],
            Request::Unknown(tag) => vec![tag.clone()],
        }
    }
}

/// A reply body. Each variant has exactly one encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ack,
    DetectorInfo(DetectorInfo),
    SimComplete { event_id: u32, hits: Hits },
    SimCompleteAsync { event_id: u32 },
    /// `event_id` is absent when the failure is not tied to an event, such
    /// as a run file that could not be opened.
    SimFailed { event_id: Option<u32> },
    NoWorkers,
    UnknownRequest,
}

impl Response {
    pub fn kind(&self) -> MessageKind {
        match self {
            Response::Ack => MessageKind::Ack,
            Response::DetectorInfo(_) => MessageKind::DetectorInfo,
            Response::SimComplete { .. } => MessageKind::SimComplete,
            Response::SimCompleteAsync { .. } => MessageKind::SimCompleteAsync,
            Response::SimFailed { .. } => MessageKind::SimFailed,
            Response::NoWorkers => MessageKind::NoWorkers,
            Response::UnknownRequest => MessageKind::UnknownRequest,
        }
    }

    pub fn encode(&self) -> Frames {
        let mut frames = vec![self.kind().frame()];
        match self {
            Response::DetectorInfo(info) => {
                frames.push(f32_frame(&info.x));
                frames.push(f32_frame(&info.y));
                frames.push(f32_frame(&info.z));
                frames.push(i32_frame(&info.channel_type));
            }
            Response::SimComplete { event_id, hits } => {
                frames.push(event_id.to_le_bytes().to_vec());
                hits.encode_into(&mut frames);
            }
            Response::SimCompleteAsync { event_id } => {
                frames.push(event_id.to_le_bytes().to_vec());
            }
            Response::SimFailed {
                event_id: Some(event_id),
            } => {
                frames.push(event_id.to_le_bytes().to_vec());
            }
            Response::SimFailed { event_id: None }
            | Response::Ack
            | Response::NoWorkers
            | Response::UnknownRequest => {}
        }
        frames
    }

    pub fn decode(body: &[Frame]) -> Result<Self, Error> {
        let tag = body
            .first()
            .ok_or_else(|| Error::malformed("empty reply body"))?;
        let kind = MessageKind::from_tag(tag).ok_or_else(|| {
            Error::malformed(format!(
                "unknown reply tag {:?}",
                String::from_utf8_lossy(tag)
            ))
        })?;
        let rest = &body[1..];
        Ok(match kind {
            MessageKind::Ack => Response::Ack,
            MessageKind::NoWorkers => Response::NoWorkers,
            MessageKind::UnknownRequest => Response::UnknownRequest,
            MessageKind::DetectorInfo => {
                expect_kind(body, kind, 5)?;
                let info = DetectorInfo {
                    x: read_f32s(&rest[0], "x")?,
                    y: read_f32s(&rest[1], "y")?,
                    z: read_f32s(&rest[2], "z")?,
                    channel_type: read_i32s(&rest[3], "channel_type")?,
                };
                let n = info.channels();
                check_len("x", n, info.x.len())?;
                check_len("y", n, info.y.len())?;
                check_len("z", n, info.z.len())?;
                Response::DetectorInfo(info)
            }
            MessageKind::SimComplete => {
                expect_kind(body, kind, 2)?;
                Response::SimComplete {
                    event_id: read_event_id(&rest[0])?,
                    hits: Hits::decode(&rest[1..])?,
                }
            }
            MessageKind::SimCompleteAsync => {
                expect_kind(body, kind, 2)?;
                Response::SimCompleteAsync {
                    event_id: read_event_id(&rest[0])?,
                }
            }
            MessageKind::SimFailed => Response::SimFailed {
                event_id: rest.first().map(|b| read_event_id(b)).transpose()?,
            },
            other => {
                return Err(Error::malformed(format!(
                    "{:?} is not a reply",
                    other
                )))
            }
        })
    }
}
