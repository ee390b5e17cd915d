//! HID report descriptor scanning for the primary usage of an interface.
//!
//! The primary usage is the Usage Page / Usage pair in effect when the first
//! Collection item opens. Only short items are interpreted; long items are
//! skipped by their declared size.

const ITEM_LONG: u8 = 0xfe;
const TAG_USAGE_PAGE: u8 = 0x04;
const TAG_USAGE: u8 = 0x08;
const TAG_COLLECTION: u8 = 0xa0;

/// Return `(usage_page, usage)` of the first collection, or `(0, 0)` parts
/// for anything the descriptor never declares.
pub(crate) fn primary_usage(descriptor: &[u8]) -> (u16, u16) {
    let mut usage_page = 0u16;
    let mut usage = 0u16;
    let mut i = 0usize;

    while i < descriptor.len() {
        let prefix = descriptor[i];
        if prefix == ITEM_LONG {
            let size = descriptor.get(i + 1).copied().unwrap_or(0) as usize;
            i += 3 + size;
            continue;
        }
        let size = match prefix & 0x03 {
            3 => 4,
            n => n as usize,
        };
        let Some(data) = descriptor.get(i + 1..i + 1 + size) else {
            break;
        };
        let value = data
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));

        match prefix & 0xfc {
            TAG_USAGE_PAGE => usage_page = value as u16,
            TAG_USAGE if size == 4 => {
                // Extended usage: page in the high half.
                usage_page = (value >> 16) as u16;
                usage = value as u16;
            }
            TAG_USAGE => usage = value as u16,
            TAG_COLLECTION => return (usage_page, usage),
            _ => {}
        }
        i += 1 + size;
    }
    (usage_page, usage)
}
