//! # Format Constants
//!
//! Magic numbers, length limits, and distinguished name prefixes shared by
//! the storage layer, the router, and the wire client. These values are part
//! of the on-file and on-wire contracts and must never change between
//! releases: area files and the setter daemon live in separate processes.

/// Total size of one mapped property area file.
pub const AREA_SIZE: usize = 128 * 1024;

/// Magic at offset 0 of every area file ("PROP").
pub const AREA_MAGIC: u32 = 0x504f_5250;

/// Area format version.
pub const AREA_VERSION: u32 = 0xfc6e_d0ab;

/// Size of the inline value buffer, including the NUL terminator. A writable
/// property value must be strictly shorter than this.
pub const VALUE_MAX: usize = 92;

/// Size of the legacy fixed name field, including the NUL terminator. Names
/// this long or longer cannot travel over the v1 wire protocol and are
/// truncated by the legacy read path.
pub const NAME_MAX: usize = 32;

/// Names with this prefix are written exactly once and never updated. Only
/// they may carry values of `VALUE_MAX` bytes or more (the long form).
pub const RO_PREFIX: &str = "ro.";

/// Names with this prefix are consumed as IPC by the setter daemon and are
/// never stored in an area; the text router drops them at load time.
pub const CTL_PREFIX: &str = "ctl.";

/// File name of the area holding the process-global serial, directly under
/// the properties directory.
pub const SERIAL_AREA_NAME: &str = "properties_serial";

/// File name of the binary routing index, directly under the properties
/// directory.
pub const INDEX_FILE_NAME: &str = "property_info";

/// Property consulted once per process to pick the wire protocol version.
pub const VERSION_PROPERTY: &str = "ro.property_service.version";

/// True for names that are write-once (see [`RO_PREFIX`]).
pub fn is_read_only(name: &str) -> bool {
    name.starts_with(RO_PREFIX)
}

/// True for names routed to the daemon as control messages.
pub fn is_control(name: &str) -> bool {
    name.starts_with(CTL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(is_read_only("ro.build.id"));
        assert!(!is_read_only("persist.ro"));
        assert!(is_control("ctl.start"));
        assert!(!is_control("sys.ctl"));
    }

    #[test]
    fn value_fits_serial_len_field() {
        // The serial word stores the value length in its top 8 bits.
        assert!(VALUE_MAX <= 0xff);
    }
}
