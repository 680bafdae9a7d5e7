//! Client side of the setter-daemon socket protocol.
//!
//! Two framings exist. v1 is a single fixed 128-byte message; the daemon
//! acknowledges by closing the connection, and a slow daemon is tolerated by
//! treating a bounded poll timeout as success. v2 is length-prefixed and
//! returns an explicit status word. The version is chosen once per process
//! from the daemon-published version property.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::OnceLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::warn;

use kura_core::{
    is_read_only, Error, Result, StoreConfig, NAME_MAX, VALUE_MAX, VERSION_PROPERTY,
};

use crate::store::PropertyStore;

/// v1 set command.
pub const MSG_SET: u32 = 1;
/// v2 set command.
pub const MSG_SET_V2: u32 = 0x0002_0001;
/// v2 status word for success.
pub const RESULT_SUCCESS: u32 = 0;

const V1_FRAME_SIZE: usize = 4 + NAME_MAX + VALUE_MAX;

/// Wire protocol revision, detected once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    V1,
    V2,
}

/// Connection-per-request client for the setter daemon.
pub struct ServiceClient {
    socket_path: PathBuf,
    timeout_ms: u64,
    protocol: OnceLock<Protocol>,
}

impl ServiceClient {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            timeout_ms: config.service_timeout_ms,
            protocol: OnceLock::new(),
        }
    }

    /// Ask the daemon to set `name` to `value`, using whichever protocol the
    /// daemon advertises through the store.
    pub fn set(&self, store: &PropertyStore, name: &str, value: &str) -> Result<()> {
        match self.protocol(store) {
            Protocol::V1 => self.set_v1(name, value),
            Protocol::V2 => self.set_v2(name, value),
        }
    }

    /// The negotiated protocol: v2 when the daemon's version property reads
    /// 2 or higher, v1 otherwise (including when the property is absent).
    pub fn protocol(&self, store: &PropertyStore) -> Protocol {
        *self.protocol.get_or_init(|| {
            let version = store
                .get(VERSION_PROPERTY)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(0);
            if version >= 2 {
                Protocol::V2
            } else {
                warn!(property = VERSION_PROPERTY, version, "using legacy wire protocol");
                Protocol::V1
            }
        })
    }

    fn set_v1(&self, name: &str, value: &str) -> Result<()> {
        // The fixed frame cannot carry long names or long values.
        if name.len() >= NAME_MAX {
            return Err(Error::NameTooLong {
                name: name.to_string(),
                limit: NAME_MAX - 1,
            });
        }
        if value.len() >= VALUE_MAX {
            return Err(Error::ValueTooLong {
                name: name.to_string(),
                len: value.len(),
                limit: VALUE_MAX - 1,
            });
        }

        let mut frame = [0u8; V1_FRAME_SIZE];
        frame[..4].copy_from_slice(&MSG_SET.to_le_bytes());
        frame[4..4 + name.len()].copy_from_slice(name.as_bytes());
        frame[4 + NAME_MAX..4 + NAME_MAX + value.len()].copy_from_slice(value.as_bytes());

        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.write_all(&frame)?;

        // The daemon acknowledges by closing the socket. It is
        // single-threaded and occasionally slow, so a poll timeout is
        // reported as success: the request is usually still in flight and
        // will be applied.
        if poll_hup(&stream, self.timeout_ms)? {
            Ok(())
        } else {
            warn!(
                name,
                value,
                timeout_ms = self.timeout_ms,
                "property service timed out; assuming the set will land"
            );
            Ok(())
        }
    }

    fn set_v2(&self, name: &str, value: &str) -> Result<()> {
        if value.len() >= VALUE_MAX && !is_read_only(name) {
            return Err(Error::ValueTooLong {
                name: name.to_string(),
                len: value.len(),
                limit: VALUE_MAX - 1,
            });
        }

        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.write_u32::<LittleEndian>(MSG_SET_V2)?;
        write_string(&mut stream, name)?;
        write_string(&mut stream, value)?;

        let status = stream.read_u32::<LittleEndian>()?;
        if status != RESULT_SUCCESS {
            return Err(Error::Protocol {
                message: format!("set \"{name}\" failed with status {status:#x}"),
            });
        }
        Ok(())
    }
}

fn write_string(stream: &mut impl Write, s: &str) -> std::io::Result<()> {
    stream.write_u32::<LittleEndian>(s.len() as u32)?;
    stream.write_all(s.as_bytes())
}

/// Wait up to `timeout_ms` for the peer to close the connection.
fn poll_hup(stream: &UnixStream, timeout_ms: u64) -> Result<bool> {
    let mut fds = [libc::pollfd {
        fd: stream.as_raw_fd(),
        events: 0,
        revents: 0,
    }];
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms as libc::c_int) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(rc == 1 && fds[0].revents & libc::POLLHUP != 0)
}

/// Frame parsing for the daemon side of the protocol. Lives here so the
/// daemon and the in-tree tests share one definition of the wire format.
pub mod frames {
    use super::*;

    /// A decoded set request.
    #[derive(Debug, PartialEq, Eq)]
    pub struct SetRequest {
        pub name: String,
        pub value: String,
    }

    /// Read one v1 fixed frame.
    pub fn read_v1(stream: &mut impl Read) -> Result<SetRequest> {
        let mut frame = [0u8; V1_FRAME_SIZE];
        stream.read_exact(&mut frame)?;
        let cmd = u32::from_le_bytes(frame[..4].try_into().unwrap_or_default());
        if cmd != MSG_SET {
            return Err(Error::Protocol {
                message: format!("unexpected v1 command {cmd:#x}"),
            });
        }
        Ok(SetRequest {
            name: field_str(&frame[4..4 + NAME_MAX]),
            value: field_str(&frame[4 + NAME_MAX..]),
        })
    }

    /// Read one v2 request (after its command word has been consumed).
    pub fn read_v2(stream: &mut impl Read) -> Result<SetRequest> {
        Ok(SetRequest {
            name: read_string(stream)?,
            value: read_string(stream)?,
        })
    }

    fn read_string(stream: &mut impl Read) -> Result<String> {
        let len = stream.read_u32::<LittleEndian>()? as usize;
        if len >= u16::MAX as usize {
            return Err(Error::Protocol {
                message: format!("unreasonable string length {len}"),
            });
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| Error::Protocol {
            message: "request string is not UTF-8".to_string(),
        })
    }

    fn field_str(field: &[u8]) -> String {
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}
