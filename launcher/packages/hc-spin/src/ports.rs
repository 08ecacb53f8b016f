use std::net::TcpListener;

use hc_spin_error::SpinError;

/// Reserves `count` distinct free ports on the loopback interface.
///
/// All listeners are held open until every port has been picked, so the OS
/// cannot hand the same port out twice within one batch. The ports are
/// released before returning, ready to be passed to `hc sandbox --run`.
pub fn allocate_ports(count: usize) -> Result<Vec<u16>, SpinError> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|err| SpinError::StreamError {
            message: format!("no available local port: {err}"),
        })?;
        let port = listener.local_addr()?.port();
        ports.push(port);
        listeners.push(listener);
    }
    drop(listeners);
    tracing::debug!(ports = ?ports, "allocated local ports");
    Ok(ports)
}
