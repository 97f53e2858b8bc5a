use std::sync::Arc;

use tracing::{debug, info, warn};
use warren_proto::{
    packet::{Packet, PacketRef, PacketType},
    serialize::ByteRead,
    setup::NewConnectionPayload,
};

use crate::{
    connection::{ConnectionInner, ForwardConnection, SuccessAction},
    context::ContextInner,
    framing::FrameReader,
};

/// The endpoint's single reader task: decodes records in stream order and dispatches them to the
/// connection they belong to, or to the accept queue.
///
/// A decoder error (including the transport ending) is terminal: the loop marks the endpoint
/// stopped so the accept queue yields end-of-stream, and force-closes every live connection so
/// readers drain out and the quiescence barrier lifts.
pub(crate) async fn run(ctx: Arc<ContextInner>, mut reader: FrameReader) {
    loop {
        let packet = match reader.read_packet().await {
            Ok(packet) => packet,
            Err(error) => {
                debug!(%error, "transport read ended, shutting the endpoint down");
                break;
            }
        };

        match packet.packet_type() {
            Some(PacketType::Data) => handle_data(&ctx, &packet).await,
            Some(PacketType::CloseConnection) => handle_close(&ctx, &packet).await,
            Some(PacketType::Success) => handle_success(&ctx, &packet).await,
            Some(PacketType::Error) => handle_error(&ctx, &packet).await,
            Some(PacketType::NewConnection) => handle_new_connection(&ctx, packet).await,
            Some(PacketType::NoMoreConnections) => {
                ctx.mark_stopped().await;
            }
            Some(PacketType::Setup) => warn!("received a setup packet after the handshake"),
            None => warn!(type_tag = packet.type_tag, "ignoring packet with an unknown type tag"),
        }
    }

    ctx.mark_stopped().await;
    for connection in ctx.table.snapshot().await {
        let _ = connection.close_immediately().await;
    }
}

async fn handle_data(ctx: &Arc<ContextInner>, packet: &Packet) {
    match ctx.table.get(packet.connection_id).await {
        Some(connection) => connection.deliver_data(&packet.payload).await,
        None => debug!(connection_id = packet.connection_id, "received data for an unknown connection"),
    }
}

/// Answers an incoming close request with a success record, or an error record if the connection
/// had already fully closed. The table entry is cloned out before any per-connection work so the
/// table lock is never held across it.
async fn handle_close(ctx: &Arc<ContextInner>, packet: &Packet) {
    let connection = match ctx.table.get(packet.connection_id).await {
        Some(connection) => connection,
        None => {
            info!(connection_id = packet.connection_id, "received close for an unknown connection");
            return;
        }
    };

    let reply = match connection.close_immediately().await {
        Ok(()) => PacketType::Success,
        Err(_) => PacketType::Error,
    };
    let _ = ctx.write_packet(PacketRef::control(reply, packet.connection_id)).await;
}

async fn handle_success(ctx: &Arc<ContextInner>, packet: &Packet) {
    let connection = match ctx.table.get(packet.connection_id).await {
        Some(connection) => connection,
        None => {
            info!(connection_id = packet.connection_id, "received success for an unknown connection");
            return;
        }
    };

    match connection.on_peer_success() {
        SuccessAction::Started => {}
        SuccessAction::FinishClose => {
            let _ = connection.close_immediately().await;
        }
        SuccessAction::Ignored(state) => {
            warn!(
                connection_id = packet.connection_id,
                %state,
                "received success for a connection not waiting on one"
            );
        }
    }
}

async fn handle_error(ctx: &Arc<ContextInner>, packet: &Packet) {
    let connection = match ctx.table.get(packet.connection_id).await {
        Some(connection) => connection,
        None => {
            debug!(connection_id = packet.connection_id, "received error for an unknown connection");
            return;
        }
    };

    info!(connection_id = packet.connection_id, "peer reported an error on the connection");
    let _ = connection.close_immediately().await;
}

async fn handle_new_connection(ctx: &Arc<ContextInner>, packet: Packet) {
    let details = match NewConnectionPayload::read(&mut &packet.payload[..]).await {
        Ok(details) => details,
        Err(error) => {
            warn!(%error, "could not decode a new connection payload");
            return;
        }
    };

    let (inner, read_half) = ConnectionInner::new(packet.connection_id, false, details, None, Arc::clone(ctx));
    if !ctx.table.register_inbound(Arc::clone(&inner)).await {
        return;
    }

    let connection = ForwardConnection::new(inner, read_half);
    if ctx.is_stopped() {
        warn!(
            connection_id = packet.connection_id,
            "peer opened a connection after no-more-connections"
        );
        let _ = connection.reject().await;
        return;
    }

    if let Err(returned) = ctx.push_incoming(connection).await {
        let _ = returned.reject().await;
    }
}
