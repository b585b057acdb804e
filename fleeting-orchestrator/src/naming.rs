use std::sync::atomic::{AtomicUsize, Ordering};

/// Produces server names for new instances. Names must be unique within a group.
pub trait NameGenerator: Send + Sync {
    fn generate(&self, prefix: &str) -> String;
}

/// `<prefix>-<10 hex chars>`, random per call.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNameGenerator;

impl NameGenerator for RandomNameGenerator {
    fn generate(&self, prefix: &str) -> String {
        let id: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(10)
            .collect();
        format!("{}-{}", prefix, id)
    }
}

/// `<prefix>-a`, `<prefix>-b`, ..., `<prefix>-z`, `<prefix>-aa`, ...
/// Deterministic, for tests and dry runs.
#[derive(Debug, Default)]
pub struct SequentialNameGenerator {
    next: AtomicUsize,
}

impl SequentialNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

fn alpha_suffix(mut n: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

impl NameGenerator for SequentialNameGenerator {
    fn generate(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", prefix, alpha_suffix(n))
    }
}
