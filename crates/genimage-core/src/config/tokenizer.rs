//! Tokenizer for the block config format.
//!
//! Grounded on the upstream tool's line-based parser (`_parse_blocks`,
//! `_get_type_config` in `genimage.py`), generalized into a proper token
//! stream so nested blocks and statements separated by either newlines or
//! `;` both parse the same way.

use crate::error::ImageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    /// A double- or single-quoted string, already unescaped.
    String(String),
    Eq,
    LBrace,
    RBrace,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ImageError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' | ';' => {
                chars.next();
            }
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        Some(c) => s.push(c),
                        None => {
                            return Err(ImageError::BadConfig(
                                "unterminated quoted string".into(),
                            ))
                        }
                    }
                }
                tokens.push(Token::String(s));
            }
            _ => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | '=' | ';' | '#' | '"' | '\'') {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                if ident.is_empty() {
                    return Err(ImageError::BadConfig(format!("unexpected character `{c}`")));
                }
                tokens.push(Token::Ident(ident));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_block_with_comment_and_quotes() {
        let src = "image foo { # a comment\n size = \"4M\"\n}\n";
        let tokens = tokenize(src).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("image".into()),
                Token::Ident("foo".into()),
                Token::LBrace,
                Token::Ident("size".into()),
                Token::Eq,
                Token::String("4M".into()),
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn treats_semicolons_as_separators() {
        let tokens = tokenize("a=1; b=2").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::Eq,
                Token::Ident("1".into()),
                Token::Ident("b".into()),
                Token::Eq,
                Token::Ident("2".into()),
            ]
        );
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(tokenize("a = \"unterminated").is_err());
    }
}
