/// Context window used when nothing better is known about a model.
pub const FALLBACK_CONTEXT_SIZE: usize = 4096;

const KNOWN_CONTEXT_SIZES: &[(&str, usize)] = &[
    ("gpt-3.5-turbo", 4096),
    ("gpt-3.5-turbo-16k", 16384),
    ("gpt-4", 8192),
    ("gpt-4-32k", 32768),
    ("gpt-4-turbo", 128_000),
    ("gpt-4o", 128_000),
    ("claude-3-haiku", 200_000),
    ("claude-3-sonnet", 200_000),
    ("claude-3-opus", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("gemini-pro", 32768),
    ("gemini-1.5-pro", 1_000_000),
    ("gemini-1.5-flash", 1_000_000),
    ("deepseek-chat", 32768),
    ("deepseek-coder", 16384),
    ("llama-3.1-8b-instant", 8192),
    ("llama-3.1-70b-versatile", 8192),
    ("mixtral-8x7b-32768", 32768),
    ("llama-2-7b-chat", 4096),
    ("llama-2-70b-chat", 4096),
    ("codellama", 16384),
    ("mistral", 8192),
];

/// Best-known context window for `model`.
///
/// The longest known name contained in the model id wins, so dated snapshots
/// like `claude-3-opus-20240229` or `gpt-4o-mini` resolve to their family.
pub fn default_context_size(model: &str) -> usize {
    let model = model.to_ascii_lowercase();
    let model = model.strip_prefix("models/").unwrap_or(&model);
    KNOWN_CONTEXT_SIZES
        .iter()
        .filter(|(name, _)| model.contains(name))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, size)| *size)
        .unwrap_or(FALLBACK_CONTEXT_SIZE)
}
