/// Maps byte offsets in a source string to 1-based line/column positions.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|&(_, b)| b == b'\n')
                .map(|(i, _)| i + 1),
        );
        SourceMap { line_starts }
    }

    /// The 1-based line containing `offset`. Offsets past the end of the
    /// source map to the last line.
    pub fn line_of(&self, offset: usize) -> u32 {
        let idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (idx + 1) as u32
    }

    /// Returns (line, col), both 1-based.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        let line = self.line_of(offset) as usize;
        let col = offset - self.line_starts[line - 1] + 1;
        (line, col)
    }

    /// The full text of the given 1-based line, without its line terminator.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .copied()
            .unwrap_or(source.len());
        source[start..end].trim_end_matches(['\n', '\r'])
    }
}
