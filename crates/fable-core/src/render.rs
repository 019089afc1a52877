/// Converts final generated text into its display form.
///
/// Called once per terminal result, never per streaming increment.
pub trait DisplayFormatter: Send + Sync {
    fn to_display(&self, text: &str) -> String;
}

/// Formatter that only normalises surrounding whitespace and line endings.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainFormatter;

impl DisplayFormatter for PlainFormatter {
    fn to_display(&self, text: &str) -> String {
        text.trim().replace("\r\n", "\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_formatter_trims() {
        assert_eq!(PlainFormatter.to_display("  a\r\nb \n"), "a\nb");
    }
}
