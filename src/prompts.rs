//! Canned text for a fresh chat session.

use uuid::Uuid;

pub const ASSISTANT_INTROS: &[&str] = &[
    "All systems synced. Ready with the latest updates.",
    "Everything's up to date. Ready to dive into the news?",
    "All caught up with today's updates. Ask me about anything specific.",
    "Latest stories loaded. What would you like to read about?",
    "Looking for something specific? I can search the news for you.",
    "Fresh batch of stories ready whenever you are.",
    "Ask me about anything happening right now.",
    "From sports to science, I'll find what matters most to you.",
    "Tell me what you're curious about, and I'll handle the rest.",
    "Looking for something in the news? I'll fetch it for you.",
    "Discover what's trending. What topic do you want to explore?",
];

pub const QUERY_SUGGESTIONS: &[&str] = &[
    "What's trending in the world today?",
    "Show me the biggest stories of the day.",
    "What's new in AI and machine learning?",
    "Any updates in space exploration?",
    "What's trending in the tech industry?",
    "What's new in business and finance?",
    "Any stock market updates today?",
    "Any sports highlights today?",
    "What's new in football and cricket?",
    "What's happening in world politics?",
    "Show me the latest science discoveries.",
    "Any new discoveries in medical research?",
    "What are today's top stories?",
];

pub const DEFAULT_SUGGESTION_COUNT: usize = 5;

// v4 uuids are random, which is all the shuffling below needs.
fn random_index(len: usize) -> usize {
    (Uuid::new_v4().as_u128() % len as u128) as usize
}

pub fn random_intro() -> &'static str {
    ASSISTANT_INTROS[random_index(ASSISTANT_INTROS.len())]
}

/// Up to `count` distinct suggestions in random order.
pub fn query_suggestions(count: usize) -> Vec<&'static str> {
    let mut pool = QUERY_SUGGESTIONS.to_vec();
    let mut picked = Vec::with_capacity(count.min(pool.len()));
    while picked.len() < count && !pool.is_empty() {
        picked.push(pool.swap_remove(random_index(pool.len())));
    }
    picked
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
