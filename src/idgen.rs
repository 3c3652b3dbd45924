//! Process-scoped generator of tag group identifiers.
//!
//! Ids pack the wall clock, a per-process machine discriminator and a
//! sequence counter into a positive 64-bit value. Within one process the
//! sequence is strictly increasing; across restarts the clock component
//! keeps collisions improbable.

use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

// layout: 41 bits of milliseconds | 10 bits of machine id | 12 bits of sequence
const MACHINE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

struct IdGen {
    machine: u64,
    state: Mutex<GenState>,
}

struct GenState {
    last_millis: u64,
    seq: u64,
}

static GEN: OnceLock<IdGen> = OnceLock::new();

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl IdGen {
    fn new() -> Self {
        let machine = (rand::random::<u16>() as u64) & ((1 << MACHINE_BITS) - 1);
        Self {
            machine,
            state: Mutex::new(GenState {
                last_millis: 0,
                seq: 0,
            }),
        }
    }

    fn next(&self) -> i64 {
        let mut st = self.state.lock();
        let mut ms = now_millis();
        if ms <= st.last_millis {
            ms = st.last_millis;
            st.seq += 1;
            if st.seq > SEQ_MASK {
                // sequence space for this millisecond is exhausted,
                // borrow the next one
                ms += 1;
                st.seq = 0;
            }
        } else {
            st.seq = 0;
        }
        st.last_millis = ms;
        let id = (ms << (MACHINE_BITS + SEQ_BITS)) | (self.machine << SEQ_BITS) | st.seq;
        (id & i64::MAX as u64) as i64
    }
}

/// Returns the next process-unique 64-bit identifier. Always positive.
pub fn next_id64() -> i64 {
    GEN.get_or_init(IdGen::new).next()
}
