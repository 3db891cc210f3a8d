//! Parses a token stream into a generic block tree: every `ident [ident]
//! { ... }` becomes a `Block`, every `key = value` becomes an `Entry`.
//!
//! This stays deliberately untyped; `builder.rs` is what knows that a
//! top-level block named `partition` means something different from one
//! named `hdimage`.

use super::tokenizer::Token;
use crate::error::ImageError;

#[derive(Debug, Clone)]
pub struct Block {
    pub kind: String,
    pub name: Option<String>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub enum Entry {
    KeyValue(String, String),
    Block(Block),
}

impl Block {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|e| match e {
            Entry::KeyValue(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn sub_blocks(&self, kind: &str) -> impl Iterator<Item = &Block> {
        self.entries.iter().filter_map(move |e| match e {
            Entry::Block(b) if b.kind == kind => Some(b),
            _ => None,
        })
    }

    /// The single sub-block whose `kind` isn't `partition` — this is the
    /// image's handler-specific config (`hdimage { }`, `vfat { }`, ...).
    pub fn handler_block(&self) -> Option<&Block> {
        self.entries.iter().find_map(|e| match e {
            Entry::Block(b) if b.kind != "partition" => Some(b),
            _ => None,
        })
    }

    pub fn key_values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|e| match e {
            Entry::KeyValue(k, v) => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }
}

pub fn parse(tokens: &[Token]) -> Result<Vec<Block>, ImageError> {
    let mut pos = 0;
    let mut blocks = Vec::new();
    while pos < tokens.len() {
        let block = parse_block(tokens, &mut pos)?;
        blocks.push(block);
    }
    Ok(blocks)
}

fn parse_block(tokens: &[Token], pos: &mut usize) -> Result<Block, ImageError> {
    let kind = expect_ident(tokens, pos)?;

    let name = match tokens.get(*pos) {
        Some(Token::Ident(n)) => {
            *pos += 1;
            Some(n.clone())
        }
        _ => None,
    };

    match tokens.get(*pos) {
        Some(Token::LBrace) => *pos += 1,
        other => {
            return Err(ImageError::BadConfig(format!(
                "expected `{{` after `{kind}`, found {other:?}"
            )))
        }
    }

    let mut entries = Vec::new();
    loop {
        match tokens.get(*pos) {
            Some(Token::RBrace) => {
                *pos += 1;
                break;
            }
            Some(Token::Ident(_)) => {
                entries.push(parse_entry(tokens, pos)?);
            }
            other => {
                return Err(ImageError::BadConfig(format!(
                    "expected `}}` or a statement, found {other:?}"
                )))
            }
        }
    }

    Ok(Block { kind, name, entries })
}

fn parse_entry(tokens: &[Token], pos: &mut usize) -> Result<Entry, ImageError> {
    // Lookahead: `ident =` is a key/value pair, `ident [ident] {` is a
    // nested block.
    let save = *pos;
    let key = expect_ident(tokens, pos)?;

    if matches!(tokens.get(*pos), Some(Token::Eq)) {
        *pos += 1;
        let value = match tokens.get(*pos) {
            Some(Token::Ident(v)) => v.clone(),
            Some(Token::String(v)) => v.clone(),
            other => {
                return Err(ImageError::BadConfig(format!(
                    "expected a value after `{key} =`, found {other:?}"
                )))
            }
        };
        *pos += 1;
        return Ok(Entry::KeyValue(key, value));
    }

    *pos = save;
    let block = parse_block(tokens, pos)?;
    Ok(Entry::Block(block))
}

fn expect_ident(tokens: &[Token], pos: &mut usize) -> Result<String, ImageError> {
    match tokens.get(*pos) {
        Some(Token::Ident(s)) => {
            *pos += 1;
            Ok(s.clone())
        }
        other => Err(ImageError::BadConfig(format!(
            "expected an identifier, found {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tokenizer::tokenize;

    #[test]
    fn parses_nested_partition_blocks() {
        let src = r#"
            image disk.img {
                hdimage {
                    partition-table-type = "gpt"
                }
                partition boot {
                    image = "boot.vfat"
                    size = "32M"
                }
            }
        "#;
        let tokens = tokenize(src).unwrap();
        let blocks = parse(&tokens).unwrap();
        assert_eq!(blocks.len(), 1);
        let image = &blocks[0];
        assert_eq!(image.kind, "image");
        assert_eq!(image.name.as_deref(), Some("disk.img"));

        let handler = image.handler_block().unwrap();
        assert_eq!(handler.kind, "hdimage");
        assert_eq!(handler.get("partition-table-type"), Some("gpt"));

        let partitions: Vec<_> = image.sub_blocks("partition").collect();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].name.as_deref(), Some("boot"));
        assert_eq!(partitions[0].get("size"), Some("32M"));
    }

    #[test]
    fn rejects_unknown_top_level_syntax() {
        let tokens = tokenize("include \"other.config\"").unwrap();
        let err = parse(&tokens).unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }
}
