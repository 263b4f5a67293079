use chrono::Utc;
use parking_lot::Mutex;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const MILLIS_WIDTH: usize = 8;
const SEQUENCE_WIDTH: usize = 4;
const MAX_SEQUENCE: u64 = 58 * 58 * 58 * 58 - 1;

#[derive(Debug, Default)]
struct GeneratorState {
    last_millis: u64,
    sequence: u64,
}

/// Issues fixed-width base-58 identifiers: eight characters of epoch millis
/// followed by four characters of per-millisecond sequence.
///
/// The alphabet is in ascending ASCII order, so comparing two ids as strings
/// orders them by issue time. The clock never moves backwards from the
/// generator's point of view: when the wall clock regresses or a millisecond's
/// sequence space is exhausted, the last observed millisecond is carried
/// forward.
#[derive(Debug, Default)]
pub struct MessageIdGenerator {
    state: Mutex<GeneratorState>,
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let (millis, sequence) = {
            let mut state = self.state.lock();
            if now > state.last_millis {
                state.last_millis = now;
                state.sequence = 0;
            } else if state.sequence >= MAX_SEQUENCE {
                state.last_millis += 1;
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
            (state.last_millis, state.sequence)
        };

        let mut id = String::with_capacity(MILLIS_WIDTH + SEQUENCE_WIDTH);
        push_base58(&mut id, millis, MILLIS_WIDTH);
        push_base58(&mut id, sequence, SEQUENCE_WIDTH);
        id
    }
}

/// Recovers the millisecond component of an id issued by [`MessageIdGenerator`].
#[cfg(test)]
fn id_millis(id: &str) -> Option<u64> {
    if id.len() != MILLIS_WIDTH + SEQUENCE_WIDTH {
        return None;
    }
    id.bytes().take(MILLIS_WIDTH).try_fold(0u64, |acc, byte| {
        let digit = ALPHABET.iter().position(|&c| c == byte)? as u64;
        acc.checked_mul(58)?.checked_add(digit)
    })
}

fn push_base58(out: &mut String, mut value: u64, width: usize) {
    let mut digits = vec![ALPHABET[0]; width];
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(value % 58) as usize];
        value /= 58;
    }
    out.extend(digits.into_iter().map(char::from));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_fixed_width_and_ordered() {
        let generator = MessageIdGenerator::new();
        let ids: Vec<String> = (0..500).map(|_| generator.next_id()).collect();
        assert!(ids.iter().all(|id| id.len() == MILLIS_WIDTH + SEQUENCE_WIDTH));
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn concurrent_callers_never_share_an_id() {
        let generator = Arc::new(MessageIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..2_000).map(|_| generator.next_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("generator thread") {
                assert!(seen.insert(id), "duplicate id issued");
            }
        }
        assert_eq!(seen.len(), 16_000);
    }

    #[test]
    fn millis_component_round_trips() {
        let before = Utc::now().timestamp_millis() as u64;
        let id = MessageIdGenerator::new().next_id();
        let millis = id_millis(&id).expect("decodable");
        assert!(millis >= before);
        assert_eq!(id_millis("short"), None);
    }

    #[test]
    fn exhausted_sequence_carries_the_clock_forward() {
        let generator = MessageIdGenerator::new();
        {
            let mut state = generator.state.lock();
            state.last_millis = u64::MAX / 1_000_000;
            state.sequence = MAX_SEQUENCE;
        }
        let id = generator.next_id();
        assert_eq!(id_millis(&id), Some(u64::MAX / 1_000_000 + 1));
        assert!(id.ends_with("1111"));
    }
}
