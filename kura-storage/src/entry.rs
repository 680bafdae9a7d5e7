//! Property entry, stored in place inside an area's data region.

use std::ffi::CStr;
use std::sync::atomic::{AtomicU32, Ordering};

use kura_core::VALUE_MAX;

use crate::serial::{serial_is_long, serial_value_len, LONG_FLAG};

/// Message left in the inline buffer of a long-form entry so that readers
/// which predate the long form see a diagnostic instead of silence.
pub(crate) const LONG_LEGACY_ERROR: &str = "Must use read_callback() to read";

/// The inline buffer of a long-form entry: a legacy diagnostic string in the
/// first 56 bytes, then the data-region offset of the value blob.
pub(crate) const LEGACY_ERROR_BUF: usize = 56;

/// One property record: the serial word, the 92-byte inline value buffer,
/// and the NUL-terminated name inline after the struct.
///
/// Short form holds the value directly in the buffer. Long form (flag bit in
/// the serial) reuses the buffer for a legacy error string plus the offset
/// of an immutable out-of-line blob; it is only created for `ro.` names and
/// never updated, so the blob needs no synchronization.
#[repr(C)]
pub struct PropEntry {
    serial: AtomicU32,
    value: [u8; VALUE_MAX],
    // name bytes + NUL follow inline
}

/// Fixed-size prefix of an entry; the inline name is allocated after it.
pub(crate) const ENTRY_HEADER: usize = std::mem::size_of::<PropEntry>();

impl PropEntry {
    /// Write a short-form entry into unpublished memory at `at`.
    ///
    /// # Safety
    /// `at` must point at `ENTRY_HEADER + name.len() + 1` writable bytes not
    /// yet visible to any reader.
    pub(crate) unsafe fn construct_short(at: *mut u8, name: &[u8], value: &[u8]) {
        let entry = at as *mut PropEntry;
        std::ptr::addr_of_mut!((*entry).serial)
            .write(AtomicU32::new((value.len() as u32) << 24));
        let buf = std::ptr::addr_of_mut!((*entry).value) as *mut u8;
        std::ptr::write_bytes(buf, 0, VALUE_MAX);
        std::ptr::copy_nonoverlapping(value.as_ptr(), buf, value.len());
        Self::write_name(at, name);
    }

    /// Write a long-form entry whose value blob lives at data-region offset
    /// `blob_offset`.
    ///
    /// # Safety
    /// Same contract as [`PropEntry::construct_short`].
    pub(crate) unsafe fn construct_long(at: *mut u8, name: &[u8], blob_offset: u32) {
        let entry = at as *mut PropEntry;
        let error_len = LONG_LEGACY_ERROR.len() as u32;
        std::ptr::addr_of_mut!((*entry).serial)
            .write(AtomicU32::new(error_len << 24 | LONG_FLAG));
        let buf = std::ptr::addr_of_mut!((*entry).value) as *mut u8;
        std::ptr::write_bytes(buf, 0, VALUE_MAX);
        std::ptr::copy_nonoverlapping(
            LONG_LEGACY_ERROR.as_ptr(),
            buf,
            LONG_LEGACY_ERROR.len(),
        );
        std::ptr::copy_nonoverlapping(
            blob_offset.to_le_bytes().as_ptr(),
            buf.add(LEGACY_ERROR_BUF),
            4,
        );
        Self::write_name(at, name);
    }

    unsafe fn write_name(at: *mut u8, name: &[u8]) {
        let dst = at.add(ENTRY_HEADER);
        std::ptr::copy_nonoverlapping(name.as_ptr(), dst, name.len());
        dst.add(name.len()).write(0);
    }

    /// The entry's serial word. Exposed so waiters can park on it.
    pub fn serial(&self) -> &AtomicU32 {
        &self.serial
    }

    /// The property name.
    pub fn name(&self) -> &str {
        unsafe {
            let p = (self as *const PropEntry as *const u8).add(ENTRY_HEADER);
            let c = CStr::from_ptr(p.cast());
            std::str::from_utf8(c.to_bytes()).unwrap_or_default()
        }
    }

    pub fn is_long(&self) -> bool {
        serial_is_long(self.serial.load(Ordering::Relaxed))
    }

    /// The inline value of a read-only short-form entry. Valid without the
    /// serial-word dance only because `ro.` values never change after `add`.
    /// For a long-form entry this is the legacy diagnostic string.
    pub fn value_str(&self) -> &str {
        let len = serial_value_len(self.serial.load(Ordering::Relaxed));
        std::str::from_utf8(&self.value[..len.min(VALUE_MAX - 1)]).unwrap_or_default()
    }

    /// Data-region offset of a long-form entry's value blob.
    pub(crate) fn long_offset(&self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.value[LEGACY_ERROR_BUF..LEGACY_ERROR_BUF + 4]);
        u32::from_le_bytes(raw)
    }

    pub(crate) fn value_ptr(&self) -> *const u8 {
        self.value.as_ptr()
    }
}
