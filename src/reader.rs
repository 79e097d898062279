//! 行リーダー: 入力 1 行を構文木のアリーナに組み立てる。
//!
//! ドライバ用の小さな読み取り器。対応するのは評価器が扱う形だけで、
//! 変数展開や `&&` / `||` は持たない。
//!
//! ## 対応構文
//!
//! - パイプライン: `cmd1 | cmd2`
//! - 並び: `a; b`、バックグラウンド: `a & b &`
//! - サブシェル: `( a; b )`
//! - リダイレクト: `<`, `>`, `>>`, `N>`, `N>&M`, `N<&M`, `N>&-`
//! - クォート: `'...'` / `"..."`（`\"`, `\\`, `\$` のみエスケープ）、裸ワードの `\X`
//! - コメント: ワード先頭の `#` 以降

use std::sync::Arc;

use thiserror::Error;

use crate::arena::{acquire_arena, ArenaBuilder, ArenaHandle, NodeId, Redirect, RedirectKind};
use crate::heap::Heap;

// ── Error ───────────────────────────────────────────────────────────

/// 読み取り時のエラー。
#[derive(Debug, Error)]
pub enum ReadError {
    /// クォートが閉じられていない。引数は開始クォート文字。
    #[error("unexpected EOF while looking for matching `{0}`")]
    UnterminatedQuote(char),
    #[error("syntax error: missing redirect target")]
    MissingRedirectTarget,
    #[error("syntax error near unexpected token `{0}`")]
    Unexpected(String),
    #[error("syntax error: unexpected end of input")]
    UnexpectedEof,
    /// アリーナの確保失敗。
    #[error(transparent)]
    Arena(#[from] crate::error::Error),
}

// ── トークナイザ ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    Semi,
    Amp,
    Open,
    Close,
    Redirect { fd: Option<i32>, kind: RedirectKind },
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Pipe => "|".into(),
            Token::Semi => ";".into(),
            Token::Amp => "&".into(),
            Token::Open => "(".into(),
            Token::Close => ")".into(),
            Token::Redirect { kind, .. } => match kind {
                RedirectKind::Input => "<".into(),
                RedirectKind::Output => ">".into(),
                RedirectKind::Append => ">>".into(),
                RedirectKind::Dup => ">&".into(),
            },
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ReadError> {
    let bytes = input.as_bytes();
    let mut pos = 0;
    let mut tokens = Vec::new();

    while pos < bytes.len() {
        let b = bytes[pos];
        if b.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let simple = match b {
            b'|' => Some(Token::Pipe),
            b';' => Some(Token::Semi),
            b'&' => Some(Token::Amp),
            b'(' => Some(Token::Open),
            b')' => Some(Token::Close),
            _ => None,
        };
        if let Some(tok) = simple {
            tokens.push(tok);
            pos += 1;
            continue;
        }
        if b == b'#' {
            break;
        }
        if b == b'<' || b == b'>' {
            let (kind, len) = redirect_op(&bytes[pos..]);
            tokens.push(Token::Redirect { fd: None, kind });
            pos += len;
            continue;
        }

        // ワード。数字だけで `<` / `>` が続けば fd 付きリダイレクト。
        let start = pos;
        let mut word = String::new();
        let mut quoted = false;
        while pos < bytes.len() {
            match bytes[pos] {
                c if c.is_ascii_whitespace() => break,
                b'|' | b';' | b'&' | b'(' | b')' => break,
                b'<' | b'>' => {
                    let digits = !quoted
                        && pos > start
                        && input[start..pos].bytes().all(|d| d.is_ascii_digit());
                    if digits {
                        let fd = input[start..pos].parse::<i32>().ok();
                        let (kind, len) = redirect_op(&bytes[pos..]);
                        pos += len;
                        tokens.push(Token::Redirect { fd, kind });
                        word.clear();
                        quoted = false;
                    }
                    break;
                }
                b'\'' => {
                    quoted = true;
                    pos += 1;
                    let end = input[pos..]
                        .find('\'')
                        .ok_or(ReadError::UnterminatedQuote('\''))?;
                    word.push_str(&input[pos..pos + end]);
                    pos += end + 1;
                }
                b'"' => {
                    quoted = true;
                    pos += 1;
                    pos = read_double_quoted(input, pos, &mut word)?;
                }
                b'\\' if pos + 1 < bytes.len() => {
                    quoted = true;
                    let ch = next_char(input, pos + 1);
                    word.push(ch);
                    pos += 1 + ch.len_utf8();
                }
                _ => {
                    let ch = next_char(input, pos);
                    word.push(ch);
                    pos += ch.len_utf8();
                }
            }
        }
        if !word.is_empty() || quoted {
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

fn next_char(input: &str, pos: usize) -> char {
    input[pos..].chars().next().unwrap_or('\\')
}

/// `<` / `>` で始まる演算子の種類と長さ。
fn redirect_op(bytes: &[u8]) -> (RedirectKind, usize) {
    match (bytes[0], bytes.get(1).copied()) {
        (b'>', Some(b'>')) => (RedirectKind::Append, 2),
        (b'>', Some(b'&')) | (b'<', Some(b'&')) => (RedirectKind::Dup, 2),
        (b'>', _) => (RedirectKind::Output, 1),
        _ => (RedirectKind::Input, 1),
    }
}

/// ダブルクォートの中身を読む。`pos` は開きクォートの次。閉じクォートの次を返す。
fn read_double_quoted(input: &str, mut pos: usize, word: &mut String) -> Result<usize, ReadError> {
    let bytes = input.as_bytes();
    while pos < bytes.len() {
        match bytes[pos] {
            b'"' => return Ok(pos + 1),
            b'\\' if matches!(bytes.get(pos + 1), Some(b'"' | b'\\' | b'$')) => {
                word.push(bytes[pos + 1] as char);
                pos += 2;
            }
            _ => {
                let ch = next_char(input, pos);
                word.push(ch);
                pos += ch.len_utf8();
            }
        }
    }
    Err(ReadError::UnterminatedQuote('"'))
}

// ── パーサー ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    builder: ArenaBuilder,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn unexpected(&self) -> ReadError {
        match self.peek() {
            Some(tok) => ReadError::Unexpected(tok.text()),
            None => ReadError::UnexpectedEof,
        }
    }

    /// `item ((';' | '&') item)* [';' | '&']`。`Close` か入力の終わりで止まる。
    fn list(&mut self) -> Result<NodeId, ReadError> {
        let mut items = Vec::new();
        loop {
            let node = self.pipeline()?;
            let background = match self.peek() {
                Some(Token::Semi) => {
                    self.pos += 1;
                    false
                }
                Some(Token::Amp) => {
                    self.pos += 1;
                    true
                }
                _ => {
                    items.push((node, false));
                    break;
                }
            };
            items.push((node, background));
            if matches!(self.peek(), None | Some(Token::Close)) {
                break;
            }
        }
        match items.as_slice() {
            [(node, false)] => Ok(*node),
            _ => Ok(self.builder.sequence(items)?),
        }
    }

    fn pipeline(&mut self) -> Result<NodeId, ReadError> {
        let mut members = vec![self.unit()?];
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.pos += 1;
            members.push(self.unit()?);
        }
        if members.len() == 1 {
            return Ok(members[0]);
        }
        Ok(self.builder.pipeline(members)?)
    }

    fn unit(&mut self) -> Result<NodeId, ReadError> {
        if matches!(self.peek(), Some(Token::Open)) {
            self.pos += 1;
            let body = self.list()?;
            match self.next() {
                Some(Token::Close) => {}
                Some(tok) => return Err(ReadError::Unexpected(tok.text())),
                None => return Err(ReadError::UnexpectedEof),
            }
            return Ok(self.builder.subshell(body)?);
        }
        self.simple()
    }

    fn simple(&mut self) -> Result<NodeId, ReadError> {
        let mut argv: Vec<String> = Vec::new();
        let mut redirects = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Word(_)) => {
                    if let Some(Token::Word(w)) = self.next() {
                        argv.push(w);
                    }
                }
                Some(&Token::Redirect { fd, kind }) => {
                    self.pos += 1;
                    let target = match self.next() {
                        Some(Token::Word(w)) => w,
                        _ => return Err(ReadError::MissingRedirectTarget),
                    };
                    let default_fd = match kind {
                        RedirectKind::Input => 0,
                        _ => 1,
                    };
                    redirects.push(Redirect {
                        fd: fd.unwrap_or(default_fd),
                        kind,
                        target,
                    });
                }
                _ => break,
            }
        }
        if argv.is_empty() && redirects.is_empty() {
            return Err(self.unexpected());
        }
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        Ok(self.builder.command(&argv, &redirects)?)
    }
}

/// 1 行をプロセス共有ヒープ上の新しいアリーナに組み立てる。空行とコメントだけの行は `None`。
pub fn read_line(line: &str) -> Result<Option<ArenaHandle>, ReadError> {
    build(line, acquire_arena)
}

/// [`read_line`] と同じだが、アリーナを `heap` に置く。
pub fn read_line_in(heap: &Arc<Heap>, line: &str) -> Result<Option<ArenaHandle>, ReadError> {
    build(line, || ArenaBuilder::new(Arc::clone(heap)))
}

fn build(line: &str, arena: impl FnOnce() -> ArenaBuilder) -> Result<Option<ArenaHandle>, ReadError> {
    let tokens = tokenize(line)?;
    if tokens.is_empty() {
        return Ok(None);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        builder: arena(),
    };
    let root = parser.list()?;
    if parser.peek().is_some() {
        return Err(parser.unexpected());
    }
    Ok(Some(parser.builder.finish(root)?))
}
