use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::canonical::IngressApi;

/// Unique, unguessable response ids without a syscall per request.
pub(crate) struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    #[must_use]
    pub(crate) fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self {
            seed: (seed_hi << 64) | seed_lo,
            counter: AtomicU64::new(1),
        }
    }

    /// Next id, prefixed the way `api` clients expect.
    pub(crate) fn next_id(&self, api: IngressApi) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let uuid = uuid::Uuid::from_u128(self.seed ^ u128::from(seq));
        format!("{}{}", id_prefix(api), uuid.simple())
    }
}

fn id_prefix(api: IngressApi) -> &'static str {
    match api {
        IngressApi::OpenAiChat => "chatcmpl-",
        IngressApi::OpenAiResponses => "resp_",
        IngressApi::Anthropic => "msg_",
        IngressApi::Gemini => "gen-",
        IngressApi::Ollama => "ollama-",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_distinct() {
        let ids = RequestIdGenerator::new();
        let a = ids.next_id(IngressApi::Anthropic);
        let b = ids.next_id(IngressApi::Anthropic);
        assert!(a.starts_with("msg_"));
        assert_ne!(a, b);
        assert!(ids.next_id(IngressApi::OpenAiResponses).starts_with("resp_"));
    }
}
