//! Kafka wire protocol framing for broker connections
//!
//! Every request is `INT32 size | INT16 api_key | INT16 api_version |
//! INT32 correlation_id | STRING client_id | body`, every response is
//! `INT32 size | INT32 correlation_id | body`. Flexible (tagged-field) headers
//! append an empty tag buffer after the client id and after the response
//! correlation id. Payload encoding beyond the header belongs to the callers,
//! except for Metadata which the connection manager needs itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::KafkalinkClientError;
use crate::identity::ClientIdentity;

pub type CorrelationId = i32;
pub type NodeId = i32;

/// Kafka API keys
pub mod api_key {
    pub const PRODUCE: i16 = 0;
    pub const FETCH: i16 = 1;
    pub const LIST_OFFSETS: i16 = 2;
    pub const METADATA: i16 = 3;
    pub const OFFSET_COMMIT: i16 = 8;
    pub const OFFSET_FETCH: i16 = 9;
    pub const API_VERSIONS: i16 = 18;
}

/// Primitive encoders/decoders shared by the request header and metadata codec
pub mod kafka {
    use super::*;

    /// Write an INT16-length string
    pub fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), KafkalinkClientError> {
        let len = i16::try_from(s.len()).map_err(|_| {
            KafkalinkClientError::protocol(format!(
                "string of {} bytes exceeds the INT16 length limit",
                s.len()
            ))
        })?;
        buf.put_i16(len);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn ensure(buf: &Bytes, needed: usize, what: &str) -> Result<(), KafkalinkClientError> {
        if buf.remaining() < needed {
            return Err(KafkalinkClientError::protocol(format!(
                "insufficient bytes for {}: need {}, have {}",
                what,
                needed,
                buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_i16(buf: &mut Bytes) -> Result<i16, KafkalinkClientError> {
        ensure(buf, 2, "INT16")?;
        Ok(buf.get_i16())
    }

    pub fn get_i32(buf: &mut Bytes) -> Result<i32, KafkalinkClientError> {
        ensure(buf, 4, "INT32")?;
        Ok(buf.get_i32())
    }

    /// Read a nullable INT16-length string
    pub fn get_string(buf: &mut Bytes) -> Result<Option<String>, KafkalinkClientError> {
        let len = get_i16(buf)?;
        if len == -1 {
            return Ok(None);
        }
        if len < 0 {
            return Err(KafkalinkClientError::protocol("invalid string length"));
        }
        ensure(buf, len as usize, "string")?;
        let bytes = buf.split_to(len as usize);
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| KafkalinkClientError::protocol("invalid UTF-8 string"))
    }

    /// Read an INT32-length array, treating null as empty
    pub fn get_array<T>(
        buf: &mut Bytes,
        mut item: impl FnMut(&mut Bytes) -> Result<T, KafkalinkClientError>,
    ) -> Result<Vec<T>, KafkalinkClientError> {
        let len = get_i32(buf)?;
        if len < -1 {
            return Err(KafkalinkClientError::protocol("invalid array length"));
        }
        let len = len.max(0) as usize;
        // Each element takes at least one byte, so a larger count is bogus
        if len > buf.remaining() {
            return Err(KafkalinkClientError::protocol(format!(
                "array length {} exceeds remaining {} bytes",
                len,
                buf.remaining()
            )));
        }
        (0..len).map(|_| item(buf)).collect()
    }

    pub fn get_unsigned_varint(buf: &mut Bytes) -> Result<u32, KafkalinkClientError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            ensure(buf, 1, "varint")?;
            let byte = buf.get_u8();
            value |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(KafkalinkClientError::protocol("varint longer than 5 bytes"))
    }

    /// Skip a tagged-field section of a flexible header
    pub fn skip_tagged_fields(buf: &mut Bytes) -> Result<(), KafkalinkClientError> {
        let count = get_unsigned_varint(buf)?;
        for _ in 0..count {
            let _tag = get_unsigned_varint(buf)?;
            let size = get_unsigned_varint(buf)? as usize;
            ensure(buf, size, "tagged field")?;
            buf.advance(size);
        }
        Ok(())
    }
}

/// A request body ready to be framed: API identity plus the caller-encoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    pub api_key: i16,
    pub api_version: i16,
    /// Use the flexible (v2) request header and expect a flexible response header
    pub flexible: bool,
    pub body: Bytes,
}

impl EncodedRequest {
    pub fn new<B: Into<Bytes>>(api_key: i16, api_version: i16, body: B) -> Self {
        Self {
            api_key,
            api_version,
            flexible: false,
            body: body.into(),
        }
    }

    /// Mark the request as using a flexible (tagged-field) header
    pub fn flexible(mut self) -> Self {
        self.flexible = true;
        self
    }

    /// Whether the response carries a tagged-field header section.
    /// ApiVersions responses always use header v0.
    pub fn flexible_response_header(&self) -> bool {
        self.flexible && self.api_key != api_key::API_VERSIONS
    }
}

/// A request tagged with the correlation id allocated by its channel
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub correlation_id: CorrelationId,
    pub request: EncodedRequest,
}

/// A complete response frame with its correlation id split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub correlation_id: CorrelationId,
    pub payload: Bytes,
}

/// Length-prefixed framing for one broker connection
#[derive(Debug, Clone)]
pub struct FrameCodec {
    client_id: ClientIdentity,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(client_id: ClientIdentity, max_frame_size: usize) -> Self {
        Self {
            client_id,
            max_frame_size,
        }
    }
}

impl Encoder<OutboundRequest> for FrameCodec {
    type Error = KafkalinkClientError;

    fn encode(&mut self, item: OutboundRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let request = &item.request;
        let header_len = 2 + 2 + 4 + 2 + self.client_id.as_str().len() + request.flexible as usize;
        let size = header_len + request.body.len();
        if size > i32::MAX as usize {
            return Err(KafkalinkClientError::protocol(format!(
                "request of {} bytes cannot be framed",
                size
            )));
        }

        dst.reserve(4 + size);
        dst.put_i32(size as i32);
        dst.put_i16(request.api_key);
        dst.put_i16(request.api_version);
        dst.put_i32(item.correlation_id);
        kafka::put_string(dst, self.client_id.as_str())?;
        if request.flexible {
            // empty tagged fields
            dst.put_u8(0);
        }
        dst.put_slice(&request.body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = ResponseFrame;
    type Error = KafkalinkClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if size < 4 {
            return Err(KafkalinkClientError::protocol(format!(
                "invalid response length prefix {}",
                size
            )));
        }
        let size = size as usize;
        if size > self.max_frame_size {
            return Err(KafkalinkClientError::protocol(format!(
                "response frame of {} bytes exceeds maximum {}",
                size, self.max_frame_size
            )));
        }

        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut payload = src.split_to(size).freeze();
        let correlation_id = payload.get_i32();
        Ok(Some(ResponseFrame {
            correlation_id,
            payload,
        }))
    }
}

/// Turns a response body into a typed value. Runs once per request.
pub trait ResponseDecoder: Send + 'static {
    type Output: Send + 'static;

    fn decode(self, body: Bytes) -> Result<Self::Output, KafkalinkClientError>;
}

impl<F, T> ResponseDecoder for F
where
    F: FnOnce(Bytes) -> Result<T, KafkalinkClientError> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn decode(self, body: Bytes) -> Result<T, KafkalinkClientError> {
        self(body)
    }
}

/// Hands back the undecoded response body
#[derive(Debug, Clone, Copy, Default)]
pub struct RawResponse;

impl ResponseDecoder for RawResponse {
    type Output = Bytes;

    fn decode(self, body: Bytes) -> Result<Bytes, KafkalinkClientError> {
        Ok(body)
    }
}

/// Metadata request (v0). An empty topic list asks for every topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRequest {
    pub topics: Vec<String>,
}

impl MetadataRequest {
    pub const API_VERSION: i16 = 0;

    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
        }
    }

    /// Encode the request; fails for a topic name too long to frame
    pub fn encode(&self) -> Result<EncodedRequest, KafkalinkClientError> {
        let mut body = BytesMut::new();
        body.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            kafka::put_string(&mut body, topic)?;
        }
        Ok(EncodedRequest::new(
            api_key::METADATA,
            Self::API_VERSION,
            body.freeze(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub node_id: NodeId,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub error_code: i16,
    pub id: i32,
    /// `-1` while no leader is elected
    pub leader: NodeId,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error_code: i16,
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

impl MetadataResponse {
    /// Decode a v0 response body (correlation id already stripped)
    pub fn decode(mut body: Bytes) -> Result<Self, KafkalinkClientError> {
        let brokers = kafka::get_array(&mut body, |buf| {
            Ok(BrokerMetadata {
                node_id: kafka::get_i32(buf)?,
                host: kafka::get_string(buf)?.unwrap_or_default(),
                port: kafka::get_i32(buf)?,
            })
        })?;

        let topics = kafka::get_array(&mut body, |buf| {
            let error_code = kafka::get_i16(buf)?;
            let name = kafka::get_string(buf)?.unwrap_or_default();
            let partitions = kafka::get_array(buf, |buf| {
                Ok(PartitionMetadata {
                    error_code: kafka::get_i16(buf)?,
                    id: kafka::get_i32(buf)?,
                    leader: kafka::get_i32(buf)?,
                    replicas: kafka::get_array(buf, kafka::get_i32)?,
                    isr: kafka::get_array(buf, kafka::get_i32)?,
                })
            })?;
            Ok(TopicMetadata {
                error_code,
                name,
                partitions,
            })
        })?;

        Ok(Self { brokers, topics })
    }

    /// Encode a v0 response body, as a broker would send it
    pub fn encode(&self) -> Result<Bytes, KafkalinkClientError> {
        let mut buf = BytesMut::new();
        buf.put_i32(self.brokers.len() as i32);
        for broker in &self.brokers {
            buf.put_i32(broker.node_id);
            kafka::put_string(&mut buf, &broker.host)?;
            buf.put_i32(broker.port);
        }
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            buf.put_i16(topic.error_code);
            kafka::put_string(&mut buf, &topic.name)?;
            buf.put_i32(topic.partitions.len() as i32);
            for partition in &topic.partitions {
                buf.put_i16(partition.error_code);
                buf.put_i32(partition.id);
                buf.put_i32(partition.leader);
                buf.put_i32(partition.replicas.len() as i32);
                partition.replicas.iter().for_each(|r| buf.put_i32(*r));
                buf.put_i32(partition.isr.len() as i32);
                partition.isr.iter().for_each(|r| buf.put_i32(*r));
            }
        }
        Ok(buf.freeze())
    }

    pub fn broker(&self, node_id: NodeId) -> Option<&BrokerMetadata> {
        self.brokers.iter().find(|b| b.node_id == node_id)
    }
}

/// Decoder for metadata responses
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataDecoder;

impl ResponseDecoder for MetadataDecoder {
    type Output = MetadataResponse;

    fn decode(self, body: Bytes) -> Result<MetadataResponse, KafkalinkClientError> {
        MetadataResponse::decode(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::new(ClientIdentity::new("test-client").unwrap(), 1024)
    }

    #[test]
    fn test_request_header_layout() {
        let mut dst = BytesMut::new();
        let request = EncodedRequest::new(api_key::FETCH, 2, Bytes::from_static(b"body"));
        codec()
            .encode(
                OutboundRequest {
                    correlation_id: 42,
                    request,
                },
                &mut dst,
            )
            .unwrap();

        let mut frame = dst.freeze();
        assert_eq!(frame.get_i32() as usize, frame.len());
        assert_eq!(frame.get_i16(), api_key::FETCH);
        assert_eq!(frame.get_i16(), 2);
        assert_eq!(frame.get_i32(), 42);
        assert_eq!(frame.get_i16(), 11);
        assert_eq!(&frame.split_to(11)[..], b"test-client");
        assert_eq!(&frame[..], b"body");
    }

    #[test]
    fn test_flexible_header_has_empty_tag_buffer() {
        let mut dst = BytesMut::new();
        let request = EncodedRequest::new(api_key::METADATA, 9, Bytes::new()).flexible();
        codec()
            .encode(
                OutboundRequest {
                    correlation_id: 1,
                    request,
                },
                &mut dst,
            )
            .unwrap();
        // size + key + version + correlation + client id + tag buffer
        assert_eq!(dst.len(), 4 + 2 + 2 + 4 + 2 + 11 + 1);
        assert_eq!(dst[dst.len() - 1], 0);
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let mut src = BytesMut::new();
        src.put_i32(8);
        src.put_i32(7);
        let mut codec = codec();
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.put_slice(b"abcd");
        src.put_i32(4);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(&frame.payload[..], b"abcd");
        // partial next frame stays buffered
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert_eq!(src.len(), 4);
    }

    #[test]
    fn test_decoder_rejects_bad_length_prefix() {
        let mut codec = codec();

        let mut negative = BytesMut::new();
        negative.put_i32(-5);
        assert!(matches!(
            codec.decode(&mut negative),
            Err(KafkalinkClientError::ProtocolViolation { .. })
        ));

        let mut oversized = BytesMut::new();
        oversized.put_i32(4096);
        assert!(codec.decode(&mut oversized).is_err());
    }

    #[test]
    fn test_metadata_response_decoding() {
        let response = MetadataResponse {
            brokers: vec![
                BrokerMetadata {
                    node_id: 1,
                    host: "kafka-1".into(),
                    port: 9092,
                },
                BrokerMetadata {
                    node_id: 2,
                    host: "kafka-2".into(),
                    port: 9092,
                },
            ],
            topics: vec![TopicMetadata {
                error_code: 0,
                name: "orders".into(),
                partitions: vec![PartitionMetadata {
                    error_code: 0,
                    id: 0,
                    leader: 2,
                    replicas: vec![2, 1],
                    isr: vec![2],
                }],
            }],
        };

        let decoded = MetadataDecoder.decode(response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.broker(2).unwrap().host, "kafka-2");
        assert!(decoded.broker(3).is_none());
    }

    #[test]
    fn test_truncated_metadata_is_a_protocol_violation() {
        let mut body = BytesMut::new();
        body.put_i32(1);
        body.put_i32(1);
        kafka::put_string(&mut body, "kafka-1").unwrap();
        let err = MetadataResponse::decode(body.freeze()).unwrap_err();
        assert!(matches!(err, KafkalinkClientError::ProtocolViolation { .. }));
    }

    #[test]
    fn test_skip_tagged_fields() {
        let mut buf = BytesMut::new();
        buf.put_u8(2); // two tags
        buf.put_u8(0);
        buf.put_u8(3);
        buf.put_slice(b"xyz");
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_slice(b"rest");
        let mut buf = buf.freeze();
        kafka::skip_tagged_fields(&mut buf).unwrap();
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn test_overlong_topic_name_is_rejected() {
        let topic = "t".repeat(40_000);
        let err = MetadataRequest::new([topic]).encode().unwrap_err();
        assert!(matches!(err, KafkalinkClientError::ProtocolViolation { .. }));

        let longest = "t".repeat(i16::MAX as usize);
        let request = MetadataRequest::new([longest.as_str()]).encode().unwrap();
        let mut body = request.body;
        assert_eq!(body.get_i32(), 1);
        assert_eq!(kafka::get_string(&mut body).unwrap(), Some(longest));
    }

    #[test]
    fn test_metadata_request_encoding() {
        let request = MetadataRequest::new(["a", "bc"]).encode().unwrap();
        assert_eq!(request.api_key, api_key::METADATA);
        assert_eq!(request.api_version, 0);
        let mut body = request.body;
        assert_eq!(body.get_i32(), 2);
        assert_eq!(kafka::get_string(&mut body).unwrap().as_deref(), Some("a"));
        assert_eq!(kafka::get_string(&mut body).unwrap().as_deref(), Some("bc"));
    }
}
