//! The read path: split each client extent into log hits and lower-tier
//! misses, issue one miss read, and splice the result in order.
//!
//! Hit regions borrow the entry's payload buffer; a reader reference
//! pins each borrowed entry until assembly finishes so the retirer
//! cannot free the buffer mid-read.

use crate::util::{background_cx, status_code};
use crate::CacheInner;
use asupersync::Cx;
use pwl_log::WriteLogEntry;
use pwl_types::ImageExtent;
use std::sync::Arc;
use tracing::trace;

/// Read continuation: status code plus the assembled bytes.
pub type ReadCompletion = Box<dyn FnOnce(i32, Vec<u8>) + Send>;

enum ReadPart {
    Miss {
        len: u64,
    },
    Hit {
        len: u64,
        entry: Arc<WriteLogEntry>,
        buffer_offset: u64,
    },
}

/// Reader references held for the duration of a read.
struct ReaderGuards {
    cache: Arc<CacheInner>,
    entries: Vec<Arc<WriteLogEntry>>,
}

impl ReaderGuards {
    fn new(cache: Arc<CacheInner>) -> Self {
        Self {
            cache,
            entries: Vec::new(),
        }
    }

    fn pin(&mut self, entry: &Arc<WriteLogEntry>) {
        entry.add_reader();
        self.cache.tracker.start_op();
        self.entries.push(Arc::clone(entry));
    }
}

impl Drop for ReaderGuards {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            entry.remove_reader();
            self.cache.tracker.finish_op();
        }
    }
}

impl CacheInner {
    pub(crate) fn aio_read(
        self: &Arc<Self>,
        cx: &Cx,
        image_extents: Vec<ImageExtent>,
        on_finish: ReadCompletion,
    ) {
        if cx.checkpoint().is_err() {
            on_finish(-libc::ECANCELED, Vec::new());
            return;
        }

        let mut parts: Vec<ReadPart> = Vec::new();
        let mut miss_extents: Vec<ImageExtent> = Vec::new();
        let mut guards = ReaderGuards::new(Arc::clone(self));

        {
            let _reader = self.entry_reader_lock.read();
            for extent in &image_extents {
                let mut extent_offset = 0_u64;
                for map_entry in self.map.find_map_entries(extent.block_extent()) {
                    if extent_offset == extent.len {
                        break;
                    }
                    let entry_image = map_entry.block_extent.image_extent();
                    let position = extent.offset + extent_offset;
                    if entry_image.offset > position {
                        // Gap before this map entry: a miss.
                        let miss_len = entry_image.offset - position;
                        let miss = ImageExtent {
                            offset: position,
                            len: miss_len,
                        };
                        miss_extents.push(miss);
                        parts.push(ReadPart::Miss { len: miss_len });
                        extent_offset += miss_len;
                    }
                    let position = extent.offset + extent_offset;
                    debug_assert!(entry_image.offset <= position);
                    // Offset of this read into the map entry's extent.
                    let entry_offset = position - entry_image.offset;
                    let hit_len =
                        (entry_image.len - entry_offset).min(extent.len - extent_offset);
                    // The map entry may cover a mid-write fragment;
                    // address the entry's buffer from the write start.
                    let buffer_offset =
                        (entry_image.offset - map_entry.entry.image_offset) + entry_offset;
                    guards.pin(&map_entry.entry);
                    parts.push(ReadPart::Hit {
                        len: hit_len,
                        entry: Arc::clone(&map_entry.entry),
                        buffer_offset,
                    });
                    extent_offset += hit_len;
                }
                if extent.len > extent_offset {
                    // Tail past the last map entry: a miss.
                    let miss_len = extent.len - extent_offset;
                    let miss = ImageExtent {
                        offset: extent.offset + extent_offset,
                        len: miss_len,
                    };
                    miss_extents.push(miss);
                    parts.push(ReadPart::Miss { len: miss_len });
                }
            }
        }

        trace!(
            target: "pwl::cache::read",
            event = "read_split",
            extents = image_extents.len(),
            hits = parts.len() - miss_extents.len(),
            misses = miss_extents.len()
        );

        if miss_extents.is_empty() {
            // Everything is resident; assemble now.
            let out = assemble(&parts, &[]);
            drop(guards);
            on_finish(0, out);
            return;
        }

        // Pass the misses to the tier below; splice on completion.
        let cache = Arc::clone(self);
        self.queue_tracked(move || {
            let cx = background_cx();
            match cache.lower.read(&cx, &miss_extents) {
                Ok(miss_bytes) => {
                    let out = assemble(&parts, &miss_bytes);
                    drop(guards);
                    on_finish(0, out);
                }
                Err(err) => {
                    let status = status_code(&Err(err));
                    drop(guards);
                    on_finish(status, Vec::new());
                }
            }
        });
    }
}

/// Splice hit buffers and miss bytes back together in address order.
fn assemble(parts: &[ReadPart], miss_bytes: &[u8]) -> Vec<u8> {
    let total: u64 = parts
        .iter()
        .map(|part| match part {
            ReadPart::Miss { len } | ReadPart::Hit { len, .. } => *len,
        })
        .sum();
    let mut out = Vec::with_capacity(total as usize);
    let mut miss_offset = 0_usize;
    for part in parts {
        match part {
            ReadPart::Miss { len } => {
                let len = *len as usize;
                out.extend_from_slice(&miss_bytes[miss_offset..miss_offset + len]);
                miss_offset += len;
            }
            ReadPart::Hit {
                len,
                entry,
                buffer_offset,
            } => {
                let buffer = entry.buffer().expect("hit entry with no buffer");
                let bytes = buffer.bytes().expect("hit buffer never filled");
                let start = *buffer_offset as usize;
                out.extend_from_slice(&bytes[start..start + *len as usize]);
            }
        }
    }
    out
}
