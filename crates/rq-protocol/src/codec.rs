//! Explicit wire codec for queue system commands.
//!
//! Frame layout: one version byte, one command kind byte, then
//! type-specific fields. Strings are u16-BE length-prefixed UTF-8; JSON
//! blobs are u32-BE length-prefixed. Optional fields carry a one-byte
//! presence flag. A frame with an unexpected version byte is rejected
//! before any field is interpreted.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use rq_common::{
    EndpointAddress, ItemData, QueueItem, QueueItemStatus, QueueSystemMetaData, ResponseType,
};

use crate::commands::*;
use crate::ProtocolError;

/// Version byte written first in every frame.
pub const QUEUE_COMMAND_VERSION: u8 = 0x01;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Encode a command into a wire frame.
pub fn encode(command: &QueueSystemCommand) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u8(QUEUE_COMMAND_VERSION);
    buf.put_u8(command.kind());

    match command {
        QueueSystemCommand::Transfer(c) => {
            put_transfer_item(&mut buf, &c.item)?;
        }
        QueueSystemCommand::MultiTransfer(c) => {
            buf.put_u16(c.items.len() as u16);
            for item in &c.items {
                put_transfer_item(&mut buf, item)?;
            }
        }
        QueueSystemCommand::TransferResponse(c) => {
            put_string(&mut buf, &c.item_id);
            buf.put_u8(c.response_type.code());
            put_optional_meta_data(&mut buf, c.meta_data.as_ref())?;
        }
        QueueSystemCommand::Completion(c) => {
            put_completion(&mut buf, c)?;
        }
        QueueSystemCommand::Cancellation(c) => {
            put_string(&mut buf, &c.item_id);
        }
        QueueSystemCommand::Relocation(c) => {
            put_string(&mut buf, &c.item_id);
        }
        QueueSystemCommand::SyncRequest(c) => {
            buf.put_u32(c.out_items.len() as u32);
            for entry in &c.out_items {
                put_string(&mut buf, &entry.item_id);
                buf.put_u8(entry.status.code());
            }
            put_meta_data(&mut buf, &c.meta_data)?;
        }
        QueueSystemCommand::SyncResponse(c) => {
            buf.put_u32(c.queued_item_ids.len() as u32);
            for id in &c.queued_item_ids {
                put_string(&mut buf, id);
            }
            buf.put_u32(c.completion_responses.len() as u32);
            for response in &c.completion_responses {
                put_completion(&mut buf, response)?;
            }
            put_meta_data(&mut buf, &c.meta_data)?;
        }
    }

    Ok(buf.freeze())
}

/// Decode a wire frame received from `from`. The decoded command's address
/// is stamped with the sending peer.
pub fn decode(frame: &[u8], from: &EndpointAddress) -> Result<QueueSystemCommand> {
    let mut buf = frame;

    let version = get_u8(&mut buf)?;
    if version != QUEUE_COMMAND_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: QUEUE_COMMAND_VERSION,
            actual: version,
        });
    }

    let kind = get_u8(&mut buf)?;
    let command = match kind {
        0x01 => QueueSystemCommand::Transfer(QueueItemTransferRequest {
            address: from.clone(),
            item: get_transfer_item(&mut buf, from)?,
        }),
        0x02 => {
            let count = get_u16(&mut buf)? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(get_transfer_item(&mut buf, from)?);
            }
            QueueSystemCommand::MultiTransfer(MultiQueueItemTransferRequest {
                address: from.clone(),
                items,
            })
        }
        0x03 => {
            let item_id = get_string(&mut buf)?;
            let response_type = get_response_type(&mut buf)?;
            let meta_data = get_optional_meta_data(&mut buf)?;
            QueueSystemCommand::TransferResponse(QueueItemTransferResponse {
                address: from.clone(),
                item_id,
                response_type,
                meta_data,
            })
        }
        0x04 => QueueSystemCommand::Completion(get_completion(&mut buf, from)?),
        0x05 => QueueSystemCommand::Cancellation(QueueItemCancellationRequest {
            address: from.clone(),
            item_id: get_string(&mut buf)?,
        }),
        0x06 => QueueSystemCommand::Relocation(QueueItemRelocationRequest {
            address: from.clone(),
            item_id: get_string(&mut buf)?,
        }),
        0x07 => {
            let count = get_u32(&mut buf)? as usize;
            let mut out_items = Vec::with_capacity(count);
            for _ in 0..count {
                let item_id = get_string(&mut buf)?;
                let status_code = get_u8(&mut buf)?;
                let status = QueueItemStatus::from_code(status_code).ok_or(
                    ProtocolError::UnknownCode {
                        field: "item status",
                        code: status_code,
                    },
                )?;
                out_items.push(SyncItemStatus { item_id, status });
            }
            let meta_data = get_meta_data(&mut buf)?;
            QueueSystemCommand::SyncRequest(QueueSystemSynchronizationRequest {
                address: from.clone(),
                out_items,
                meta_data,
            })
        }
        0x08 => {
            let id_count = get_u32(&mut buf)? as usize;
            let mut queued_item_ids = Vec::with_capacity(id_count);
            for _ in 0..id_count {
                queued_item_ids.push(get_string(&mut buf)?);
            }
            let response_count = get_u32(&mut buf)? as usize;
            let mut completion_responses = Vec::with_capacity(response_count);
            for _ in 0..response_count {
                completion_responses.push(get_completion(&mut buf, from)?);
            }
            let meta_data = get_meta_data(&mut buf)?;
            QueueSystemCommand::SyncResponse(QueueSystemSynchronizationResponse {
                address: from.clone(),
                queued_item_ids,
                completion_responses,
                meta_data,
            })
        }
        other => return Err(ProtocolError::UnknownCommandKind(other)),
    };

    Ok(command)
}

// ----------------------------------------------------------------------
// Field writers
// ----------------------------------------------------------------------

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn put_optional_string(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn put_blob(buf: &mut BytesMut, value: &serde_json::Value) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(&bytes);
    Ok(())
}

fn put_meta_data(buf: &mut BytesMut, meta: &QueueSystemMetaData) -> Result<()> {
    put_blob(buf, &serde_json::to_value(meta)?)
}

fn put_optional_meta_data(buf: &mut BytesMut, meta: Option<&QueueSystemMetaData>) -> Result<()> {
    match meta {
        Some(meta) => {
            buf.put_u8(1);
            put_meta_data(buf, meta)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

/// A transfer carries the item's identity and payload; status, counters
/// and addressing are receiver-local state.
fn put_transfer_item(buf: &mut BytesMut, item: &QueueItem) -> Result<()> {
    put_string(buf, &item.id);
    put_optional_string(buf, item.parent_id.as_deref());
    put_string(buf, &item.item_data.description);
    put_blob(buf, &item.item_data.payload)
}

fn put_completion(buf: &mut BytesMut, response: &QueueItemCompletionResponse) -> Result<()> {
    put_string(buf, &response.item_id);
    buf.put_u8(response.response_type.code());
    match &response.response_data {
        Some(data) => {
            buf.put_u8(1);
            put_blob(buf, data)?;
        }
        None => buf.put_u8(0),
    }
    put_optional_meta_data(buf, response.meta_data.as_ref())
}

// ----------------------------------------------------------------------
// Field readers
// ----------------------------------------------------------------------

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)
}

fn get_optional_string(buf: &mut &[u8]) -> Result<Option<String>> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_string(buf)?)),
    }
}

fn get_blob(buf: &mut &[u8]) -> Result<serde_json::Value> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let value = serde_json::from_slice(&buf[..len])?;
    buf.advance(len);
    Ok(value)
}

fn get_meta_data(buf: &mut &[u8]) -> Result<QueueSystemMetaData> {
    let value = get_blob(buf)?;
    Ok(serde_json::from_value(value)?)
}

fn get_optional_meta_data(buf: &mut &[u8]) -> Result<Option<QueueSystemMetaData>> {
    match get_u8(buf)? {
        0 => Ok(None),
        _ => Ok(Some(get_meta_data(buf)?)),
    }
}

fn get_response_type(buf: &mut &[u8]) -> Result<ResponseType> {
    let code = get_u8(buf)?;
    ResponseType::from_code(code).ok_or(ProtocolError::UnknownCode {
        field: "response type",
        code,
    })
}

fn get_completion(
    buf: &mut &[u8],
    from: &EndpointAddress,
) -> Result<QueueItemCompletionResponse> {
    let item_id = get_string(buf)?;
    let response_type = get_response_type(buf)?;
    let response_data = match get_u8(buf)? {
        0 => None,
        _ => Some(get_blob(buf)?),
    };
    let meta_data = get_optional_meta_data(buf)?;
    Ok(QueueItemCompletionResponse {
        address: from.clone(),
        item_id,
        response_type,
        response_data,
        meta_data,
    })
}

fn get_transfer_item(buf: &mut &[u8], from: &EndpointAddress) -> Result<QueueItem> {
    let id = get_string(buf)?;
    let parent_id = get_optional_string(buf)?;
    let description = get_string(buf)?;
    let payload = get_blob(buf)?;

    let mut item = QueueItem::with_id(id, ItemData { description, payload });
    item.parent_id = parent_id;
    item.sender_receiver_address = Some(from.clone());
    item.touch_send_receive_time();
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> EndpointAddress {
        EndpointAddress::new("peer-a")
    }

    fn sample_item() -> QueueItem {
        QueueItem::new(ItemData::new("sample job", serde_json::json!({"n": 42})))
    }

    #[test]
    fn transfer_round_trip() {
        let item = sample_item();
        let command = QueueSystemCommand::Transfer(QueueItemTransferRequest {
            address: EndpointAddress::new("receiver"),
            item: item.clone(),
        });

        let frame = encode(&command).unwrap();
        let decoded = decode(&frame, &peer()).unwrap();

        match decoded {
            QueueSystemCommand::Transfer(req) => {
                assert_eq!(req.item.id, item.id);
                assert_eq!(req.item.item_data.description, "sample job");
                assert_eq!(req.item.item_data.payload, serde_json::json!({"n": 42}));
                // Address comes from the receiving link, not the wire
                assert_eq!(req.address, peer());
                assert_eq!(req.item.sender_receiver_address, Some(peer()));
            }
            other => panic!("unexpected command: {}", other),
        }
    }

    #[test]
    fn completion_round_trip_with_payload_and_meta_data() {
        let mut meta = QueueSystemMetaData::new(3, Some(100), false);
        meta.extra
            .insert("node".into(), serde_json::json!("receiver"));

        let command = QueueSystemCommand::Completion(QueueItemCompletionResponse {
            address: EndpointAddress::new("sender"),
            item_id: "item-1".into(),
            response_type: ResponseType::DoneFailure,
            response_data: Some(serde_json::json!({"error": "boom"})),
            meta_data: Some(meta.clone()),
        });

        let frame = encode(&command).unwrap();
        match decode(&frame, &peer()).unwrap() {
            QueueSystemCommand::Completion(resp) => {
                assert_eq!(resp.item_id, "item-1");
                assert_eq!(resp.response_type, ResponseType::DoneFailure);
                assert_eq!(resp.response_data, Some(serde_json::json!({"error": "boom"})));
                assert_eq!(resp.meta_data, Some(meta));
            }
            other => panic!("unexpected command: {}", other),
        }
    }

    #[test]
    fn sync_request_round_trip() {
        let command = QueueSystemCommand::SyncRequest(QueueSystemSynchronizationRequest {
            address: EndpointAddress::new("receiver"),
            out_items: vec![
                SyncItemStatus {
                    item_id: "a".into(),
                    status: QueueItemStatus::Dispatching,
                },
                SyncItemStatus {
                    item_id: "b".into(),
                    status: QueueItemStatus::Dispatched,
                },
            ],
            meta_data: QueueSystemMetaData::new(0, Some(50), false),
        });

        let frame = encode(&command).unwrap();
        match decode(&frame, &peer()).unwrap() {
            QueueSystemCommand::SyncRequest(req) => {
                assert_eq!(req.out_items.len(), 2);
                assert_eq!(req.out_items[0].item_id, "a");
                assert_eq!(req.out_items[0].status, QueueItemStatus::Dispatching);
                assert_eq!(req.meta_data.in_queue_max_length, Some(50));
            }
            other => panic!("unexpected command: {}", other),
        }
    }

    #[test]
    fn sync_response_round_trip() {
        let completion = QueueItemCompletionResponse {
            address: EndpointAddress::new("sender"),
            item_id: "done-1".into(),
            response_type: ResponseType::DoneSuccess,
            response_data: None,
            meta_data: None,
        };
        let command = QueueSystemCommand::SyncResponse(QueueSystemSynchronizationResponse {
            address: EndpointAddress::new("sender"),
            queued_item_ids: vec!["a".into(), "b".into()],
            completion_responses: vec![completion],
            meta_data: QueueSystemMetaData::new(2, None, false),
        });

        let frame = encode(&command).unwrap();
        match decode(&frame, &peer()).unwrap() {
            QueueSystemCommand::SyncResponse(resp) => {
                assert_eq!(resp.queued_item_ids, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(resp.completion_responses.len(), 1);
                assert_eq!(resp.completion_responses[0].item_id, "done-1");
                assert_eq!(resp.meta_data.in_queue_length, 2);
                assert_eq!(resp.meta_data.in_queue_max_length, None);
            }
            other => panic!("unexpected command: {}", other),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let command = QueueSystemCommand::Cancellation(QueueItemCancellationRequest {
            address: EndpointAddress::new("receiver"),
            item_id: "x".into(),
        });
        let frame = encode(&command).unwrap();

        let mut tampered = frame.to_vec();
        tampered[0] = 0x02;

        match decode(&tampered, &peer()) {
            Err(ProtocolError::VersionMismatch { expected, actual }) => {
                assert_eq!(expected, QUEUE_COMMAND_VERSION);
                assert_eq!(actual, 0x02);
            }
            other => panic!("expected version mismatch, got {:?}", other.map(|c| c.name())),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let frame = vec![QUEUE_COMMAND_VERSION, 0x7f];
        assert!(matches!(
            decode(&frame, &peer()),
            Err(ProtocolError::UnknownCommandKind(0x7f))
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let command = QueueSystemCommand::Transfer(QueueItemTransferRequest {
            address: EndpointAddress::new("receiver"),
            item: sample_item(),
        });
        let frame = encode(&command).unwrap();

        assert!(matches!(
            decode(&frame[..frame.len() - 3], &peer()),
            Err(ProtocolError::Truncated) | Err(ProtocolError::Payload(_))
        ));
        assert!(matches!(decode(&[], &peer()), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn multi_transfer_round_trip() {
        let items: Vec<QueueItem> = (0..3).map(|_| sample_item()).collect();
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let command = QueueSystemCommand::MultiTransfer(MultiQueueItemTransferRequest {
            address: EndpointAddress::new("receiver"),
            items,
        });

        let frame = encode(&command).unwrap();
        match decode(&frame, &peer()).unwrap() {
            QueueSystemCommand::MultiTransfer(req) => {
                let decoded_ids: Vec<String> = req.items.iter().map(|i| i.id.clone()).collect();
                assert_eq!(decoded_ids, ids);
            }
            other => panic!("unexpected command: {}", other),
        }
    }
}
