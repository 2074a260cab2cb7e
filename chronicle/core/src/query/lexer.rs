//! Shallow jq tokenizer
//!
//! Just enough lexing for the denylist and the per-record rewrite: it knows
//! string literals (including `\(...)` interpolations, which are code),
//! identifiers, `$variables`, `.field` accesses, numbers and operators. It
//! does not parse; jaq does that.

/// Token classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// Bare identifier or keyword (`select`, `as`, `mod::f`)
    Ident(String),
    /// Field access written `.name`
    Field(String),
    /// Variable reference (`$x`, `$__loc__`)
    Var(String),
    /// Static text of a string literal
    Str(String),
    /// Numeric literal
    Num,
    /// Single punctuation: `. [ ] ( ) { } , : ;`
    Punct(char),
    /// Operator run (`|`, `|=`, `//`, `==`, `..`, `?`)
    Op(String),
}

/// A token and its byte span in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub(crate) kind: TokenKind,
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Token {
    pub(crate) fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    pub(crate) fn is_op(&self, op: &str) -> bool {
        matches!(&self.kind, TokenKind::Op(o) if o == op)
    }

    pub(crate) fn is_ident(&self, name: &str) -> bool {
        matches!(&self.kind, TokenKind::Ident(i) if i == name)
    }
}

const OPERATOR_CHARS: &str = "|=<>!+-*/%?";

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenize `src`; unknown characters are skipped
///
/// An unterminated string ends at end of input.
pub(crate) fn tokenize(src: &str) -> Vec<Token> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    // Paren depth at which each open interpolation resumes its string
    let mut interpolations: Vec<usize> = Vec::new();
    let mut paren_depth = 0usize;

    let offset = |idx: usize| chars.get(idx).map_or(src.len(), |(o, _)| *o);

    loop {
        let Some(&(start, c)) = chars.get(i) else {
            break;
        };

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '#' {
            while chars.get(i).is_some_and(|(_, c)| *c != '\n') {
                i += 1;
            }
            continue;
        }

        if c == '"' {
            i = lex_string(&chars, i + 1, start, &mut tokens, &offset);
            if tokens.last().is_some_and(|t| t.kind == TokenKind::Op("\\(".into())) {
                tokens.pop();
                interpolations.push(paren_depth);
                paren_depth += 1;
            }
            continue;
        }

        if c == ')' && interpolations.last() == Some(&(paren_depth.saturating_sub(1))) {
            // Closing an interpolation: resume the enclosing string
            interpolations.pop();
            paren_depth = paren_depth.saturating_sub(1);
            i = lex_string(&chars, i + 1, start, &mut tokens, &offset);
            if tokens.last().is_some_and(|t| t.kind == TokenKind::Op("\\(".into())) {
                tokens.pop();
                interpolations.push(paren_depth);
                paren_depth += 1;
            }
            continue;
        }

        if c == '$' {
            let mut j = i + 1;
            while chars.get(j).is_some_and(|(_, c)| is_ident_char(*c)) {
                j += 1;
            }
            let name: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Var(name),
                start,
                end: offset(j),
            });
            i = j;
            continue;
        }

        if c == '.' {
            let next = chars.get(i + 1).map(|(_, c)| *c);
            match next {
                Some(n) if is_ident_start(n) => {
                    let mut j = i + 1;
                    while chars.get(j).is_some_and(|(_, c)| is_ident_char(*c)) {
                        j += 1;
                    }
                    let name: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
                    tokens.push(Token {
                        kind: TokenKind::Field(name),
                        start,
                        end: offset(j),
                    });
                    i = j;
                }
                Some('.') => {
                    tokens.push(Token {
                        kind: TokenKind::Op("..".into()),
                        start,
                        end: offset(i + 2),
                    });
                    i += 2;
                }
                _ => {
                    tokens.push(Token {
                        kind: TokenKind::Punct('.'),
                        start,
                        end: offset(i + 1),
                    });
                    i += 1;
                }
            }
            continue;
        }

        if is_ident_start(c) {
            let mut j = i;
            loop {
                while chars.get(j).is_some_and(|(_, c)| is_ident_char(*c)) {
                    j += 1;
                }
                let namespaced = chars.get(j).is_some_and(|(_, c)| *c == ':')
                    && chars.get(j + 1).is_some_and(|(_, c)| *c == ':');
                if !namespaced {
                    break;
                }
                j += 2;
            }
            let name: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(name),
                start,
                end: offset(j),
            });
            i = j;
            continue;
        }

        if c.is_ascii_digit() {
            let mut j = i;
            while chars
                .get(j)
                .is_some_and(|(_, c)| c.is_ascii_alphanumeric() || *c == '.')
            {
                j += 1;
            }
            tokens.push(Token {
                kind: TokenKind::Num,
                start,
                end: offset(j),
            });
            i = j;
            continue;
        }

        let alternative_follows = chars.get(i + 1).is_some_and(|(_, c)| *c == '/');
        if c == '?' && !alternative_follows {
            tokens.push(Token {
                kind: TokenKind::Op("?".into()),
                start,
                end: offset(i + 1),
            });
            i += 1;
            continue;
        }

        if OPERATOR_CHARS.contains(c) {
            let mut j = i;
            while chars.get(j).is_some_and(|(_, c)| OPERATOR_CHARS.contains(*c)) {
                j += 1;
            }
            let op: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Op(op),
                start,
                end: offset(j),
            });
            i = j;
            continue;
        }

        if "[](){},:;".contains(c) {
            match c {
                '(' => paren_depth += 1,
                ')' => paren_depth = paren_depth.saturating_sub(1),
                _ => {}
            }
            tokens.push(Token {
                kind: TokenKind::Punct(c),
                start,
                end: offset(i + 1),
            });
        }
        i += 1;
    }

    tokens
}

/// Lex string contents starting after an opening quote (or after the `)` of
/// an interpolation). Pushes a `Str` token, then an `Op("\\(")` marker when
/// the string continues into an interpolation. Returns the next index.
fn lex_string(
    chars: &[(usize, char)],
    mut i: usize,
    start: usize,
    tokens: &mut Vec<Token>,
    offset: &dyn Fn(usize) -> usize,
) -> usize {
    let mut text = String::new();
    loop {
        let Some(&(_, c)) = chars.get(i) else {
            tokens.push(Token {
                kind: TokenKind::Str(text),
                start,
                end: offset(i),
            });
            return i;
        };
        match c {
            '"' => {
                tokens.push(Token {
                    kind: TokenKind::Str(text),
                    start,
                    end: offset(i + 1),
                });
                return i + 1;
            }
            '\\' => match chars.get(i + 1).map(|(_, c)| *c) {
                Some('(') => {
                    tokens.push(Token {
                        kind: TokenKind::Str(text),
                        start,
                        end: offset(i),
                    });
                    tokens.push(Token {
                        kind: TokenKind::Op("\\(".into()),
                        start: offset(i),
                        end: offset(i + 2),
                    });
                    return i + 2;
                }
                Some(escaped) => {
                    text.push('\\');
                    text.push(escaped);
                    i += 2;
                }
                None => i += 1,
            },
            other => {
                text.push(other);
                i += 1;
            }
        }
    }
}

/// Index of the token closing the bracket opened at `open`
pub(crate) fn matching_close(tokens: &[Token], open: usize) -> Option<usize> {
    let (open_c, close_c) = match tokens.get(open)?.kind {
        TokenKind::Punct('(') => ('(', ')'),
        TokenKind::Punct('[') => ('[', ']'),
        TokenKind::Punct('{') => ('{', '}'),
        _ => return None,
    };
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        if token.is_punct(open_c) {
            depth += 1;
        } else if token.is_punct(close_c) {
            depth -= 1;
            if depth == 0 {
                return Some(idx);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_fields_idents_and_vars() {
        assert_eq!(
            kinds(".type | select($x) | .a.b"),
            vec![
                TokenKind::Field("type".into()),
                TokenKind::Op("|".into()),
                TokenKind::Ident("select".into()),
                TokenKind::Punct('('),
                TokenKind::Var("$x".into()),
                TokenKind::Punct(')'),
                TokenKind::Op("|".into()),
                TokenKind::Field("a".into()),
                TokenKind::Field("b".into()),
            ]
        );
    }

    #[test]
    fn test_strings_hide_identifiers() {
        assert_eq!(
            kinds(r#"select(.x == "input \"env\"")"#),
            vec![
                TokenKind::Ident("select".into()),
                TokenKind::Punct('('),
                TokenKind::Field("x".into()),
                TokenKind::Op("==".into()),
                TokenKind::Str(r#"input \"env\""#.into()),
                TokenKind::Punct(')'),
            ]
        );
    }

    #[test]
    fn test_interpolation_is_code() {
        let tokens = kinds(r#""a\(input)b""#);
        assert!(tokens.contains(&TokenKind::Ident("input".into())));
        assert_eq!(tokens.first(), Some(&TokenKind::Str("a".into())));
        assert_eq!(tokens.last(), Some(&TokenKind::Str("b".into())));
    }

    #[test]
    fn test_optional_before_pipe() {
        let tokens = tokenize(".[]?|.a");
        assert!(tokens[3].is_op("?"));
        assert!(tokens[4].is_op("|"));
    }

    #[test]
    fn test_update_is_not_pipe() {
        let tokens = tokenize(".[] |= 1");
        assert!(tokens[3].is_op("|="));
    }

    #[test]
    fn test_comments_and_namespaces() {
        assert_eq!(
            kinds("lib::f # input\n"),
            vec![TokenKind::Ident("lib::f".into())]
        );
    }

    #[test]
    fn test_matching_close() {
        let tokens = tokenize("[.[] | (.a)] | length");
        assert_eq!(matching_close(&tokens, 0), Some(8));
        assert!(tokens[8].is_punct(']'));
        assert_eq!(matching_close(&tokens, 2), Some(3));
        assert_eq!(matching_close(&tokens, 1), None);
    }
}
