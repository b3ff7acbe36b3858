// Per-connection loop: decode requests, dispatch, tear down on exit
use crate::dispatch::{ConnectionState, Dispatcher};
use crate::error::ServerError;
use crate::evaluator::Evaluator;
use nrepl_transport::{FrameReader, FrameWriter, Transport, TransportError};
use tracing::{debug, info, warn};

/// Serve one accepted connection until the peer goes away or the stream
/// breaks. The connection's default session is closed on the way out;
/// cloned sessions outlive it.
pub fn serve<E: Evaluator>(
    transport: Box<dyn Transport>,
    dispatcher: Dispatcher<E>,
    write_queue: usize,
    verbose: bool,
) -> Result<(), ServerError> {
    let peer = transport.peer();
    let mut control = transport.try_clone()?;
    let mut writer = FrameWriter::spawn(transport.try_clone()?, write_queue)?;
    let sink = writer.sink();
    let mut state = ConnectionState::default();
    debug!(peer = %peer, "connection opened");

    for request in FrameReader::new(transport) {
        match request {
            Ok(request) => {
                if verbose {
                    info!(
                        peer = %peer,
                        op = request.get_str("op").unwrap_or("<none>"),
                        id = request.id().unwrap_or("<none>"),
                        session = request.session().unwrap_or("<none>"),
                        "request"
                    );
                }
                dispatcher.dispatch(request, &mut state, &sink);
            }
            Err(TransportError::Malformed(e)) => {
                warn!(peer = %peer, error = %e, "malformed input, closing connection");
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "connection read ended");
                break;
            }
        }
    }

    if let Some(id) = state.default_session_id() {
        dispatcher.sessions().close(id);
    }
    writer.close();
    let _ = control.disconnect();
    debug!(peer = %peer, default_session = ?state.default_session_id(), "connection closed");
    Ok(())
}
