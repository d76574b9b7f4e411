//! Handshake and frame dispatch for a single connection.

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use pppp_protocol::{
    Handshake, Message, Metadata, ObjectPayload, OpCode, ProtocolError, MAX_FRAME_SIZE,
};
use pppp_storage::{AnyObject, AnyStore, IdentityHash, StorageError};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{debug, info, trace, warn};

use crate::connection::frame_codec;
use crate::node::NodeShared;
use crate::{now_millis, Connection, ConnectionState, P2pError, RelayPolicy, Result, Role};

type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;

/// Runs the handshake on a fresh transport and, on success, registers the
/// connection, sends the snapshot and starts the dispatch loop.
pub(crate) async fn establish(
    shared: Arc<NodeShared>,
    stream: TcpStream,
    host: String,
    port: u16,
    role: Role,
    metadata: Option<Metadata>,
) -> Result<Arc<Connection>> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, frame_codec());
    let connection = Connection::spawn(
        shared.next_connection_id(),
        host,
        port,
        role,
        write_half,
        shared.cancel.child_token(),
        shared.connection_context(),
    );
    connection.set_state(ConnectionState::Handshaking);

    let handshake = async {
        match role {
            Role::Inbound => accept_handshake(&shared, &connection, &mut reader).await,
            Role::Outbound => initiate_handshake(&shared, &connection, &mut reader, metadata).await,
        }
    };
    let outcome = tokio::select! {
        _ = connection.cancel_token().cancelled() => Err(P2pError::TransportClosed),
        result = tokio::time::timeout(shared.config.handshake_timeout(), handshake) => {
            result.unwrap_or(Err(P2pError::Timeout("handshake")))
        }
    };
    if let Err(e) = outcome {
        warn!(
            peer = %connection.host(),
            port = connection.port(),
            ?role,
            error = %e,
            "handshake failed"
        );
        connection.close();
        return Err(e);
    }

    let max = shared.config.max_connections;
    if !shared.connections.try_insert(connection.clone(), max) {
        warn!(
            peer = %connection.host(),
            port = connection.port(),
            max,
            "connection limit reached"
        );
        connection.disconnect();
        return Err(P2pError::MaxConnections(max));
    }
    connection.set_state(ConnectionState::Open);
    if connection.is_closed() {
        shared.connections.remove(connection.id());
        return Err(P2pError::TransportClosed);
    }
    info!(
        peer = %connection.host(),
        port = connection.port(),
        id = connection.id(),
        ?role,
        "connection open"
    );

    send_snapshot(&shared, &connection);
    tokio::spawn(read_loop(shared.clone(), connection.clone(), reader));
    Ok(connection)
}

async fn read_message(connection: &Connection, reader: &mut FrameReader) -> Result<Message> {
    let frame = reader.next().await.ok_or(P2pError::TransportClosed)??.freeze();
    let Some(&op) = frame.first() else {
        return Err(ProtocolError::Malformed("empty frame".into()).into());
    };
    let opcode = OpCode::from_byte(op)?;
    let payload = connection.consume(frame.slice(1..))?;
    Ok(Message::decode(opcode, &payload)?)
}

async fn accept_handshake(
    shared: &NodeShared,
    connection: &Connection,
    reader: &mut FrameReader,
) -> Result<()> {
    let request = match read_message(connection, reader).await? {
        Message::Identify(request) => request,
        other => {
            return Err(P2pError::HandshakeRejected(format!(
                "expected IDENTIFY, got {}",
                other.opcode()
            )))
        }
    };
    debug!(
        peer = %connection.host(),
        version = ?request.version,
        "received IDENTIFY"
    );

    let verdict = connection.spy().intercept_connection_request(
        request.version,
        request.timestamp,
        request.metadata.as_ref(),
    );
    if verdict.did_fail() {
        connection.send(&Message::Rejection)?;
        return Err(P2pError::HandshakeRejected(
            "refused by connection spy".into(),
        ));
    }

    connection.send(&Message::Ok(Handshake {
        version: shared.config.version,
        timestamp: now_millis(),
        metadata: verdict.into_value(),
    }))
}

async fn initiate_handshake(
    shared: &NodeShared,
    connection: &Connection,
    reader: &mut FrameReader,
    metadata: Option<Metadata>,
) -> Result<()> {
    connection.send(&Message::Identify(Handshake {
        version: shared.config.version,
        timestamp: now_millis(),
        metadata,
    }))?;

    match read_message(connection, reader).await? {
        Message::Ok(reply) => {
            debug!(peer = %connection.host(), version = ?reply.version, "received OK");
            let accepted = connection.spy().intercept_completed_handshake(
                reply.version,
                reply.timestamp,
                reply.metadata.as_ref(),
            );
            if accepted {
                Ok(())
            } else {
                Err(P2pError::HandshakeRejected(
                    "vetoed by connection spy".into(),
                ))
            }
        }
        Message::Rejection => Err(P2pError::HandshakeRejected("refused by peer".into())),
        other => Err(P2pError::HandshakeRejected(format!(
            "expected OK, got {}",
            other.opcode()
        ))),
    }
}

/// Upper bound on the payload of one INITIALIZE frame. The rest of the
/// frame is left for what the transform stages add.
const SNAPSHOT_BATCH_BYTES: usize = MAX_FRAME_SIZE / 2;

fn send_snapshot(shared: &NodeShared, connection: &Connection) {
    let mut objects = Vec::new();
    for store in &shared.stores {
        match store.snapshot() {
            Ok(mut snapshot) => objects.append(&mut snapshot),
            Err(e) => warn!(
                type_name = store.type_name(),
                error = %e,
                "skipping store in snapshot"
            ),
        }
    }

    let total = objects.len();
    let (mut sent, mut frames) = (0, 0);
    for batch in snapshot_batches(objects, SNAPSHOT_BATCH_BYTES) {
        let count = batch.len();
        match connection.send(&Message::Initialize(batch)) {
            Ok(()) => {
                sent += count;
                frames += 1;
            }
            Err(P2pError::TransportClosed) => break,
            Err(e) => warn!(
                peer = %connection.host(),
                count,
                error = %e,
                "could not send INITIALIZE batch"
            ),
        }
    }
    debug!(peer = %connection.host(), sent, total, frames, "sent INITIALIZE");
}

/// Splits a snapshot into batches whose INITIALIZE payload fits `budget`.
///
/// An object larger than `budget` travels alone. An empty snapshot still
/// yields one empty batch.
fn snapshot_batches(objects: Vec<ObjectPayload>, budget: usize) -> Vec<Vec<ObjectPayload>> {
    const COUNT_PREFIX: usize = 4;

    let mut batches = Vec::new();
    let mut batch = Vec::new();
    let mut size = COUNT_PREFIX;
    for object in objects {
        let len = object.encoded_len();
        if !batch.is_empty() && size + len > budget {
            batches.push(std::mem::take(&mut batch));
            size = COUNT_PREFIX;
        }
        size += len;
        batch.push(object);
    }
    if !batch.is_empty() || batches.is_empty() {
        batches.push(batch);
    }
    batches
}

async fn read_loop(shared: Arc<NodeShared>, connection: Arc<Connection>, mut reader: FrameReader) {
    let cancel = connection.cancel_token().clone();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => dispatch(&shared, &connection, frame.freeze()),
            Some(Err(e)) => {
                warn!(
                    peer = %connection.host(),
                    port = connection.port(),
                    error = %e,
                    "transport error"
                );
                break;
            }
            None => {
                debug!(
                    peer = %connection.host(),
                    port = connection.port(),
                    "peer closed the transport"
                );
                break;
            }
        }
    }
    connection.close();
}

/// Decodes and handles one frame. Failures drop the frame, never the
/// connection.
fn dispatch(shared: &NodeShared, connection: &Connection, frame: Bytes) {
    let Some(&op) = frame.first() else {
        warn!(peer = %connection.host(), "dropping empty frame");
        return;
    };
    let Ok(opcode) = OpCode::from_byte(op) else {
        debug!(peer = %connection.host(), opcode = op, "dropping frame with unknown opcode");
        return;
    };

    let message = connection
        .consume(frame.slice(1..))
        .and_then(|payload| Ok(Message::decode(opcode, &payload)?));
    let message = match message {
        Ok(message) => message,
        Err(e) => {
            warn!(peer = %connection.host(), %opcode, error = %e, "dropping undecodable frame");
            return;
        }
    };

    trace!(peer = %connection.host(), %opcode, "dispatch");
    if let Err(e) = handle(shared, connection, message) {
        warn!(peer = %connection.host(), %opcode, error = %e, "dropping frame");
    }
}

fn handle(shared: &NodeShared, connection: &Connection, message: Message) -> Result<()> {
    match message {
        Message::Ping(sent) => connection.send(&Message::Pong(sent)),
        Message::Pong(sent) => {
            connection.handle_pong(sent);
            Ok(())
        }
        Message::Kick | Message::Rejection => {
            info!(peer = %connection.host(), port = connection.port(), "peer ended the connection");
            connection.close();
            Ok(())
        }
        Message::Identify(_) | Message::Ok(_) => {
            debug!(peer = %connection.host(), "ignoring handshake message on open connection");
            Ok(())
        }
        Message::Initialize(objects) => {
            apply_snapshot(shared, connection, objects);
            Ok(())
        }
        Message::Creation(object) => {
            let (store, decoded) = decode(shared, &object)?;
            let changed = store.apply_insert(decoded)?;
            debug!(type_name = store.type_name(), changed, "applied CREATION");
            relay(shared, connection, Message::Creation(object), changed);
            Ok(())
        }
        Message::Change(change) => {
            let (store, decoded) = decode(shared, &change.object)?;
            let original = IdentityHash::from_i64(change.original_hash);
            let changed = store.apply_change(original, decoded, &change.hint)?;
            debug!(
                type_name = store.type_name(),
                hash = %original,
                property = %change.hint.property,
                changed,
                "applied CHANGE"
            );
            relay(shared, connection, Message::Change(change), changed);
            Ok(())
        }
        Message::Removal(raw) => {
            let hash = IdentityHash::from_i64(raw);
            let changed = shared
                .stores
                .iter()
                .find(|store| store.contains_hash(hash))
                .is_some_and(|store| store.apply_removal(hash));
            debug!(%hash, changed, "applied REMOVAL");
            relay(shared, connection, Message::Removal(raw), changed);
            Ok(())
        }
    }
}

fn apply_snapshot(shared: &NodeShared, connection: &Connection, objects: Vec<ObjectPayload>) {
    let mut changed = Vec::new();
    for object in &objects {
        let applied =
            decode(shared, object).and_then(|(store, decoded)| Ok(store.apply_insert(decoded)?));
        match applied {
            Ok(true) => changed.push(object.clone()),
            Ok(false) => {}
            Err(e) => warn!(
                peer = %connection.host(),
                tag = object.type_tag,
                error = %e,
                "skipping snapshot entry"
            ),
        }
    }
    debug!(
        peer = %connection.host(),
        received = objects.len(),
        changed = changed.len(),
        "applied INITIALIZE"
    );

    let relayed = match shared.config.relay_policy {
        RelayPolicy::Flood => objects,
        RelayPolicy::OnChange => changed,
    };
    if !relayed.is_empty() {
        relay(shared, connection, Message::Initialize(relayed), true);
    }
}

/// Decodes an object and finds the store for its type.
fn decode(shared: &NodeShared, payload: &ObjectPayload) -> Result<(Arc<dyn AnyStore>, AnyObject)> {
    let codec = shared
        .codecs
        .by_tag(payload.type_tag)
        .ok_or(StorageError::UnknownTypeTag(payload.type_tag))?;
    let object = codec.read_from_bytes(&payload.data)?;
    let store = shared
        .store_for(codec.accepts())
        .ok_or(P2pError::NotRegistered(codec.type_name()))?;
    Ok((store, object))
}

/// Forwards an applied message to every other open connection.
fn relay(shared: &NodeShared, origin: &Connection, message: Message, changed: bool) {
    if !shared.config.relay_policy.should_relay(changed) {
        return;
    }
    let opcode = message.opcode();
    let delivered = shared.connections.broadcast(&message, Some(origin.id()));
    trace!(%opcode, delivered, origin = origin.id(), "relayed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn object(len: usize) -> ObjectPayload {
        ObjectPayload::new(1, vec![0u8; len])
    }

    fn sizes(batches: &[Vec<ObjectPayload>]) -> Vec<usize> {
        batches.iter().map(Vec::len).collect()
    }

    #[test]
    fn empty_snapshot_is_one_empty_batch() {
        let batches = snapshot_batches(Vec::new(), 100);
        assert_eq!(sizes(&batches), vec![0]);
    }

    #[test]
    fn batches_stay_within_budget() {
        // Each object encodes to 25 bytes; 4 + 3 * 25 fits, a fourth does not.
        let batches = snapshot_batches((0..7).map(|_| object(20)).collect(), 80);
        assert_eq!(sizes(&batches), vec![3, 3, 1]);
        for batch in batches {
            let payload = Message::Initialize(batch).encode_payload();
            assert!(payload.len() <= 80);
        }
    }

    #[test]
    fn oversized_object_travels_alone() {
        let batches = snapshot_batches(vec![object(10), object(500), object(10)], 100);
        assert_eq!(sizes(&batches), vec![1, 1, 1]);
        assert_eq!(batches[1][0].data.len(), 500);
    }
}
