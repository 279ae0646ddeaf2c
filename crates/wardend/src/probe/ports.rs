use std::io;
use std::net::{Ipv4Addr, TcpListener};

/// Reserves two distinct free loopback ports.
///
/// Both listeners are held until both ports are known, so the ports differ.
/// They are released on return; the engine binds them shortly after.
pub(crate) fn allocate_port_pair() -> io::Result<(u16, u16)> {
    let control = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let mixed = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok((control.local_addr()?.port(), mixed.local_addr()?.port()))
}
