#![no_main]
use libfuzzer_sys::fuzz_target;
use multifetch::{Session, SessionId, SessionTable};

fuzz_target!(|data: &[u8]| {
    // Arbitrary insert/remove/lookup sequences, including stale ids
    let mut table = SessionTable::new(8);
    let mut seen: Vec<SessionId> = Vec::new();

    for chunk in data.chunks(2) {
        let pick = chunk.get(1).copied().unwrap_or(0) as usize;
        match chunk[0] % 3 {
            0 => {
                if let Ok(id) = table.insert_with(|id| Session::new(id, "http://fuzz/")) {
                    seen.push(id);
                }
            }
            1 if !seen.is_empty() => {
                let id = seen[pick % seen.len()];
                table.remove(id);
                assert!(table.get(id).is_none());
            }
            _ if !seen.is_empty() => {
                let id = seen[pick % seen.len()];
                if let Some(session) = table.get(id) {
                    assert_eq!(session.id(), id);
                }
            }
            _ => {}
        }
        assert_eq!(table.ids().count(), table.len());
        assert!(table.len() <= 8);
    }
});
