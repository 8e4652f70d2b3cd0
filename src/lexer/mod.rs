use logos::Logos;

use crate::diagnostic::{SourceMap, Span};

/// Raw lexemes recognized by logos. The public [`TokenKind`] layers the
/// synthesized `Eof` and `Error` kinds on top, which the parser needs but
/// the pattern-matching layer never produces.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
enum RawKind {
    // Punctuation
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(";")]
    Semicolon,

    // Operators (longest match wins, so `**` beats `*` and `<<` beats `<`)
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token("/")]
    Slash,
    #[token("*")]
    Star,
    #[token("**")]
    StarStar,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    // Literals
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r#""[^"]*""#)]
    Str,
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,

    // Keywords
    #[token("and")]
    And,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("nil")]
    Nil,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("super")]
    Super,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Minus,
    Plus,
    Slash,
    Star,
    StarStar,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Shl,
    Shr,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Identifier,
    Str,
    Number,
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    /// End of input, emitted forever once the source is exhausted.
    Eof,
    /// Lexical error; the token's lexeme is the error message.
    Error,
}

impl From<RawKind> for TokenKind {
    fn from(raw: RawKind) -> Self {
        match raw {
            RawKind::LeftParen => TokenKind::LeftParen,
            RawKind::RightParen => TokenKind::RightParen,
            RawKind::LeftBrace => TokenKind::LeftBrace,
            RawKind::RightBrace => TokenKind::RightBrace,
            RawKind::LeftBracket => TokenKind::LeftBracket,
            RawKind::RightBracket => TokenKind::RightBracket,
            RawKind::Comma => TokenKind::Comma,
            RawKind::Dot => TokenKind::Dot,
            RawKind::Semicolon => TokenKind::Semicolon,
            RawKind::Minus => TokenKind::Minus,
            RawKind::Plus => TokenKind::Plus,
            RawKind::Slash => TokenKind::Slash,
            RawKind::Star => TokenKind::Star,
            RawKind::StarStar => TokenKind::StarStar,
            RawKind::Percent => TokenKind::Percent,
            RawKind::Amp => TokenKind::Amp,
            RawKind::Pipe => TokenKind::Pipe,
            RawKind::Caret => TokenKind::Caret,
            RawKind::Tilde => TokenKind::Tilde,
            RawKind::Shl => TokenKind::Shl,
            RawKind::Shr => TokenKind::Shr,
            RawKind::Bang => TokenKind::Bang,
            RawKind::BangEqual => TokenKind::BangEqual,
            RawKind::Equal => TokenKind::Equal,
            RawKind::EqualEqual => TokenKind::EqualEqual,
            RawKind::Greater => TokenKind::Greater,
            RawKind::GreaterEqual => TokenKind::GreaterEqual,
            RawKind::Less => TokenKind::Less,
            RawKind::LessEqual => TokenKind::LessEqual,
            RawKind::Identifier => TokenKind::Identifier,
            RawKind::Str => TokenKind::Str,
            RawKind::Number => TokenKind::Number,
            RawKind::And => TokenKind::And,
            RawKind::Class => TokenKind::Class,
            RawKind::Else => TokenKind::Else,
            RawKind::False => TokenKind::False,
            RawKind::For => TokenKind::For,
            RawKind::Fun => TokenKind::Fun,
            RawKind::If => TokenKind::If,
            RawKind::Nil => TokenKind::Nil,
            RawKind::Or => TokenKind::Or,
            RawKind::Print => TokenKind::Print,
            RawKind::Return => TokenKind::Return,
            RawKind::Super => TokenKind::Super,
            RawKind::This => TokenKind::This,
            RawKind::True => TokenKind::True,
            RawKind::Var => TokenKind::Var,
            RawKind::While => TokenKind::While,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub span: Span,
    pub line: u32,
}

/// On-demand tokenizer. Each call to [`Scanner::next_token`] advances one
/// token; after the end of input it keeps returning `Eof`.
pub struct Scanner<'src> {
    source: &'src str,
    lexer: logos::Lexer<'src, RawKind>,
    map: SourceMap,
    done: bool,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner {
            source,
            lexer: RawKind::lexer(source),
            map: SourceMap::new(source),
            done: false,
        }
    }

    pub fn next_token(&mut self) -> Token<'src> {
        if self.done {
            return self.eof_token();
        }
        match self.lexer.next() {
            Some(Ok(raw)) => {
                let range = self.lexer.span();
                Token {
                    kind: raw.into(),
                    lexeme: self.lexer.slice(),
                    span: Span { start: range.start, end: range.end },
                    line: self.map.line_of(range.start),
                }
            }
            Some(Err(())) => {
                let range = self.lexer.span();
                let span = Span { start: range.start, end: range.end };
                let line = self.map.line_of(range.start);
                if self.lexer.slice().starts_with('"') {
                    // A string with no closing quote fails to match; nothing
                    // after it can recover, so stop scanning.
                    self.done = true;
                    Token { kind: TokenKind::Error, lexeme: "Unterminated string.", span, line }
                } else {
                    Token { kind: TokenKind::Error, lexeme: "Unexpected character.", span, line }
                }
            }
            None => {
                self.done = true;
                self.eof_token()
            }
        }
    }

    fn eof_token(&self) -> Token<'src> {
        let end = self.source.len();
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            span: Span { start: end, end },
            line: self.map.line_of(end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> Vec<Token<'_>> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = scanner.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scan_operators() {
        assert_eq!(
            kinds("+ - * / % ** & | ^ ~ << >>"),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::StarStar,
                TokenKind::Amp,
                TokenKind::Pipe,
                TokenKind::Caret,
                TokenKind::Tilde,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn two_char_operators_beat_single() {
        assert_eq!(
            kinds("== != <= >= << >> **"),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::StarStar,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_vs_identifiers() {
        assert_eq!(
            kinds("class classy var variable"),
            vec![
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn all_keywords() {
        let kws = "and class else false fun for if nil or print return super this true var while";
        let got = kinds(kws);
        assert_eq!(got.len(), 17); // 16 keywords + Eof
        assert!(!got.contains(&TokenKind::Identifier));
    }

    #[test]
    fn number_lexemes() {
        let tokens = scan("42 3.25 0");
        assert_eq!(tokens[0].lexeme, "42");
        assert_eq!(tokens[1].lexeme, "3.25");
        assert_eq!(tokens[2].lexeme, "0");
        assert!(tokens[..3].iter().all(|t| t.kind == TokenKind::Number));
    }

    #[test]
    fn string_lexeme_includes_quotes() {
        let tokens = scan(r#""hi there""#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "\"hi there\"");
    }

    #[test]
    fn string_may_span_lines() {
        let tokens = scan("\"one\ntwo\"");
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].line, 1);
    }

    #[test]
    fn line_comment_skipped() {
        assert_eq!(
            kinds("print 1; // the answer\nprint 2;"),
            vec![
                TokenKind::Print,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Print,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_numbers_advance() {
        let tokens = scan("var a = 1;\nvar b = 2;\n\nprint a;");
        assert_eq!(tokens[0].line, 1);
        let b_decl: Vec<_> = tokens.iter().filter(|t| t.line == 2).collect();
        assert_eq!(b_decl.len(), 5); // var b = 2 ;
        assert_eq!(tokens.iter().find(|t| t.kind == TokenKind::Print).unwrap().line, 4);
    }

    #[test]
    fn unexpected_character() {
        let tokens = scan("var a = @;");
        let err = tokens.iter().find(|t| t.kind == TokenKind::Error).unwrap();
        assert_eq!(err.lexeme, "Unexpected character.");
        // Scanning continues after the bad character.
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Semicolon));
    }

    #[test]
    fn unterminated_string() {
        let tokens = scan("var a = \"oops");
        let err = tokens.iter().find(|t| t.kind == TokenKind::Error).unwrap();
        assert_eq!(err.lexeme, "Unterminated string.");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn eof_is_sticky() {
        let mut scanner = Scanner::new("nil");
        assert_eq!(scanner.next_token().kind, TokenKind::Nil);
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
        assert_eq!(scanner.next_token().kind, TokenKind::Eof);
    }
}
