pub mod checkpoint;
pub mod device;
pub mod generation;
pub mod t5;

pub use t5::T5Summarizer;

/// Instruction prefix T5 was trained with for the summarization task.
pub const SUMMARIZE_PREFIX: &str = "summarize: ";

pub fn build_prompt(text: &str) -> String {
    format!("{SUMMARIZE_PREFIX}{text}")
}

/// Text in, summary out. Implementations may block for the duration of
/// generation.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, text: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_prefixed_verbatim() {
        assert_eq!(build_prompt("Rust is fast."), "summarize: Rust is fast.");
        assert_eq!(build_prompt("  spaced "), "summarize:   spaced ");
    }
}
