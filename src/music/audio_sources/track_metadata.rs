//! Defines the `Track` struct, a unified representation of a playable track
//! from any provider, and the opaque `encoded_id` that identifies it.
//!
//! The encoded id is the standard-base64 form of a versioned binary payload:
//! a version byte, length-prefixed (`u16`, big-endian) UTF-8 strings for the
//! title, author, identifier and source tag, two optional strings (uri and
//! artwork url, each behind a presence byte), the duration in milliseconds as
//! a big-endian `u64`, and a stream flag byte.

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::Provider;
use crate::music::utils::music_manager::{MusicError, MusicResult};

const ENCODING_VERSION: u8 = 1;

/// The decodable payload behind an `encoded_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub author: String,
    pub identifier: String,
    pub source: Provider,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub duration_ms: u64,
    pub is_stream: bool,
}

impl TrackInfo {
    /// Encodes the payload into its opaque base64 form.
    pub fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(64);
        buf.push(ENCODING_VERSION);
        write_str(&mut buf, &self.title);
        write_str(&mut buf, &self.author);
        write_str(&mut buf, &self.identifier);
        write_str(&mut buf, self.source.tag());
        write_opt(&mut buf, self.uri.as_deref());
        write_opt(&mut buf, self.artwork_url.as_deref());
        buf.extend_from_slice(&self.duration_ms.to_be_bytes());
        buf.push(u8::from(self.is_stream));
        BASE64_STANDARD.encode(buf)
    }

    /// Decodes an `encoded_id` back into its payload.
    pub fn decode(encoded: &str) -> MusicResult<Self> {
        let bytes = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| MusicError::TrackDecode(format!("invalid base64: {}", e)))?;
        let mut reader = Reader { bytes: &bytes, pos: 0 };

        let version = reader.u8()?;
        if version != ENCODING_VERSION {
            return Err(MusicError::TrackDecode(format!(
                "unsupported encoding version {}",
                version
            )));
        }

        let title = reader.string()?;
        let author = reader.string()?;
        let identifier = reader.string()?;
        let source = reader
            .string()?
            .parse()
            .map_err(|_| MusicError::TrackDecode("unknown source tag".to_string()))?;
        let uri = reader.optional_string()?;
        let artwork_url = reader.optional_string()?;
        let duration_ms = reader.u64()?;
        let is_stream = reader.u8()? != 0;

        if reader.pos != bytes.len() {
            return Err(MusicError::TrackDecode("trailing bytes".to_string()));
        }

        Ok(Self {
            title,
            author,
            identifier,
            source,
            uri,
            artwork_url,
            duration_ms,
            is_stream,
        })
    }
}

/// Unified representation of a resolved, playable track.
///
/// Tracks are immutable once resolved; queues own them and the track cache
/// keeps read-only clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Opaque id, content-addressed by the encoded payload.
    pub encoded_id: String,
    pub title: String,
    pub author: String,
    /// Provider-specific identifier (video id, ISRC, path...).
    pub identifier: String,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub source_provider: Provider,
    pub uri: Option<String>,
    pub artwork_url: Option<String>,
    pub is_stream: bool,
    /// Identifier of the node that resolved the track, kept for re-resolution.
    pub origin_node: Option<String>,
    /// The name of the user who requested the track.
    pub requester: Option<String>,
}

impl Track {
    /// Builds a track from its payload, computing the encoded id.
    pub fn from_info(info: TrackInfo) -> Self {
        let encoded = info.encode();
        Self::from_encoded_info(encoded, info)
    }

    /// Builds a track from an encoded id supplied by a node along with its payload.
    pub fn from_encoded_info(encoded_id: String, info: TrackInfo) -> Self {
        Self {
            encoded_id,
            title: info.title,
            author: info.author,
            identifier: info.identifier,
            duration: Duration::from_millis(info.duration_ms),
            source_provider: info.source,
            uri: info.uri,
            artwork_url: info.artwork_url,
            is_stream: info.is_stream,
            origin_node: None,
            requester: None,
        }
    }

    /// Rebuilds a track from an encoded id alone.
    pub fn decode(encoded_id: &str) -> MusicResult<Self> {
        let info = TrackInfo::decode(encoded_id)?;
        Ok(Self::from_encoded_info(encoded_id.trim().to_string(), info))
    }

    pub fn with_origin_node(mut self, node: impl Into<String>) -> Self {
        self.origin_node = Some(node.into());
        self
    }

    pub fn with_requester(mut self, requester: Option<&str>) -> Self {
        self.requester = requester.map(str::to_string);
        self
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// The payload this track carries.
    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            title: self.title.clone(),
            author: self.author.clone(),
            identifier: self.identifier.clone(),
            source: self.source_provider,
            uri: self.uri.clone(),
            artwork_url: self.artwork_url.clone(),
            duration_ms: self.duration_ms(),
            is_stream: self.is_stream,
        }
    }
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    // Strings longer than a u16 length are cut at the nearest char boundary.
    let mut end = value.len().min(usize::from(u16::MAX));
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &value.as_bytes()[..end];
    let len = u16::try_from(bytes.len()).unwrap_or(u16::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn write_opt(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.push(1);
            write_str(buf, value);
        }
        None => buf.push(0),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> MusicResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| MusicError::TrackDecode("payload is truncated".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> MusicResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> MusicResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    fn string(&mut self) -> MusicResult<String> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.take(2)?);
        let len = usize::from(u16::from_be_bytes(raw));
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MusicError::TrackDecode(format!("invalid utf-8: {}", e)))
    }

    fn optional_string(&mut self) -> MusicResult<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => self.string().map(Some),
            flag => Err(MusicError::TrackDecode(format!(
                "invalid presence flag {}",
                flag
            ))),
        }
    }
}
