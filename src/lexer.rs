//! 行スプリッタ: 1 行の入力をクォートを尊重して「セグメント + 演算子」の列に分割する。
//!
//! ## 認識する構造
//!
//! - クォート: `'...'`, `"..."`, `` `...` ``（内部の演算子文字は無視）
//! - 置換のネスト: `$( ... )`, `${ ... }`
//! - エスケープ: `\X` は `X` を演算子として扱わない
//! - 演算子: `|`, `||`, `&&`, `;`, `&`（2 文字演算子を優先）
//! - `2>&1` / `>&2` / `&>file` の `&` はリダイレクトの一部
//!
//! セグメントのテキストはクォートやエスケープを含んだまま返す。
//! クォート除去は [`parser`](crate::parser) が担当する。

use std::fmt;

/// セグメントの後ろに付く演算子。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `|`: 次のセグメントと同じパイプラインで実行
    Pipe,
    /// `&&`: 直前が成功した場合のみ次を実行
    And,
    /// `||`: 直前が失敗した場合のみ次を実行
    Or,
    /// `;`: 無条件に次を実行
    Seq,
    /// `&`: ここまでのチェーンをバックグラウンドで起動
    Background,
    /// 行末
    End,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pipe => "|",
            Self::And => "&&",
            Self::Or => "||",
            Self::Seq => ";",
            Self::Background => "&",
            Self::End => "",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    /// クォート・置換・行末バックスラッシュが閉じていない。継続行を読めば完結しうる。
    #[error("unexpected end of input")]
    NeedsMoreInput,
    /// どの文法規則にも一致しない演算子の並び。
    #[error("syntax error near unexpected token `{0}`")]
    Syntax(String),
}

/// 分割結果の 1 要素。
pub type Piece = (String, Operator);

/// 1 行を分割する。空行（空白のみ）は空の Vec を返す。
///
/// 失敗時に途中までの結果を返すことはない。
pub fn split(line: &str) -> Result<Vec<Piece>, SplitError> {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let at = |i: usize| chars.get(i).copied();

    let mut pieces: Vec<Piece> = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut paren_depth = 0usize;
    let mut brace_depth = 0usize;
    let mut i = 0;

    while i < len {
        let c = chars[i];

        // シングルクォート内はエスケープも効かない
        if quote == Some('\'') {
            current.push(c);
            if c == '\'' {
                quote = None;
            }
            i += 1;
            continue;
        }

        if c == '\\' {
            match at(i + 1) {
                Some(next) => {
                    current.push(c);
                    current.push(next);
                    i += 2;
                    continue;
                }
                None => return Err(SplitError::NeedsMoreInput),
            }
        }

        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            i += 1;
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
                i += 1;
                continue;
            }
            '$' if at(i + 1) == Some('(') => {
                paren_depth += 1;
                current.push_str("$(");
                i += 2;
                continue;
            }
            '$' if at(i + 1) == Some('{') => {
                brace_depth += 1;
                current.push_str("${");
                i += 2;
                continue;
            }
            _ => {}
        }

        if paren_depth > 0 || brace_depth > 0 {
            match c {
                '(' if paren_depth > 0 => paren_depth += 1,
                ')' if paren_depth > 0 => paren_depth -= 1,
                '}' if brace_depth > 0 => brace_depth -= 1,
                _ => {}
            }
            current.push(c);
            i += 1;
            continue;
        }

        let op = match c {
            '|' if at(i + 1) == Some('|') => {
                if at(i + 2) == Some('|') {
                    return Err(SplitError::Syntax("|||".to_string()));
                }
                i += 2;
                Operator::Or
            }
            '|' => {
                i += 1;
                Operator::Pipe
            }
            '&' if at(i + 1) == Some('&') => {
                if at(i + 2) == Some('&') {
                    return Err(SplitError::Syntax("&&&".to_string()));
                }
                i += 2;
                Operator::And
            }
            // リダイレクトの一部: `2>&1`, `>&2`, `<&0`, `&>file`
            '&' if i > 0 && matches!(chars[i - 1], '>' | '<') || at(i + 1) == Some('>') => {
                current.push(c);
                i += 1;
                continue;
            }
            '&' => {
                i += 1;
                Operator::Background
            }
            ';' => {
                if at(i + 1) == Some(';') {
                    return Err(SplitError::Syntax(";;".to_string()));
                }
                i += 1;
                Operator::Seq
            }
            '\n' => {
                i += 1;
                if current.trim().is_empty() {
                    continue;
                }
                Operator::Seq
            }
            _ => {
                current.push(c);
                i += 1;
                continue;
            }
        };

        let segment = current.trim();
        if segment.is_empty() {
            return Err(SplitError::Syntax(op.as_str().to_string()));
        }
        pieces.push((segment.to_string(), op));
        current.clear();
    }

    if quote.is_some() || paren_depth > 0 || brace_depth > 0 {
        return Err(SplitError::NeedsMoreInput);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        pieces.push((tail.to_string(), Operator::End));
        return Ok(pieces);
    }

    // 末尾が演算子で終わった
    if let Some(last) = pieces.last_mut() {
        match last.1 {
            Operator::Seq => last.1 = Operator::End,
            Operator::Background => {}
            op => return Err(SplitError::Syntax(op.as_str().to_string())),
        }
    }
    Ok(pieces)
}

/// 継続行を連結する。行末の `\` は取り除いてそのまま繋ぎ、それ以外（クォート途中など）は改行で繋ぐ。
pub fn join_continuation(buf: &mut String, next: &str) {
    let trimmed = buf.trim_end_matches([' ', '\t']);
    if trimmed.ends_with('\\') && !trimmed.ends_with("\\\\") {
        let keep = trimmed.len() - 1;
        buf.truncate(keep);
    } else {
        buf.push('\n');
    }
    buf.push_str(next);
}
