//! ポリシー設定値のリテラル式パーサー。
//!
//! 設定ファイルに書かれた `['ls', 'echo'] + ['cat'] - ['ls']` のような値を、
//! 汎用の式評価器を使わず手書きの再帰下降パーサーで解析する。受理するのは次の部分集合のみ:
//!
//! - 文字列: `'...'` / `"..."`（`\n` `\t` `\r` `\\` `\'` `\"` `\xHH` `\uXXXX` エスケープ）
//! - 整数: `42`, `-1`
//! - 真偽値: `True` / `False`（`true` / `false` も可）
//! - リスト: `[a, b, ...]`（末尾カンマ可）
//! - マッピング: `{'key': value, ...}`
//! - リスト演算: `+` / `-`（左から順に適用）
//!
//! 先頭に `+` / `-` が付いた式は「差分式」として扱い、下位の設定セクションから
//! 継承した値に対して適用する（[`Expr::apply_list`]）。

/// リテラル値。
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<Value>),
    /// 挿入順を保持するマッピング。キーは常に文字列。
    Map(Vec<(String, Value)>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// 文字列・整数をテキストとして取り出す。リスト要素の正規化に使う。
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 整数として解釈する。真偽値は 0 / 1 に変換する。
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }
}

/// 二項演算子（および差分式の先頭符号）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sign {
    Plus,
    Minus,
}

/// 解析済みのリテラル式。
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// 先頭に符号があれば `true`。継承値への差分として適用される。
    pub incremental: bool,
    /// 左から順に適用する項。先頭項の符号は符号なしなら `Plus`。
    pub terms: Vec<(Sign, Value)>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum LiteralError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected character `{found}` at offset {offset}")]
    UnexpectedChar { found: char, offset: usize },
    #[error("invalid escape sequence at offset {0}")]
    BadEscape(usize),
    #[error("invalid number `{0}`")]
    BadNumber(String),
    #[error("mapping keys must be strings")]
    NonStringKey,
    #[error("list algebra cannot be applied to {0}")]
    NotAList(&'static str),
}

impl Expr {
    /// 符号なしの単項式ならその値を返す。スカラー設定値の取り出しに使う。
    pub fn as_scalar(&self) -> Option<&Value> {
        match self.terms.as_slice() {
            [(Sign::Plus, v)] if !self.incremental => Some(v),
            _ => None,
        }
    }

    /// リスト演算を `base` に適用する。
    ///
    /// 差分式なら `base` から、そうでなければ空リストから開始する。
    /// スカラー項は 1 要素リストとして扱う（`'all'` 等）。
    /// 戻り値は `(結果, 減算項に現れた要素)`。後者は `path` の拒否リストに使う。
    pub fn apply_list(&self, base: &[Value]) -> Result<(Vec<Value>, Vec<Value>), LiteralError> {
        let mut result: Vec<Value> = if self.incremental { base.to_vec() } else { Vec::new() };
        let mut removed = Vec::new();

        for (sign, term) in &self.terms {
            let items: Vec<Value> = match term {
                Value::List(items) => items.clone(),
                Value::Map(_) => return Err(LiteralError::NotAList("a mapping")),
                scalar => vec![scalar.clone()],
            };
            match sign {
                Sign::Plus => {
                    for item in items {
                        if !result.contains(&item) {
                            result.push(item);
                        }
                    }
                }
                Sign::Minus => {
                    for item in items {
                        result.retain(|v| v != &item);
                        removed.push(item);
                    }
                }
            }
        }
        Ok((result, removed))
    }

    /// マッピング演算を `base` に適用する。`+` は挿入/上書き、`-` はキー削除。
    pub fn apply_map(&self, base: &[(String, Value)]) -> Result<Vec<(String, Value)>, LiteralError> {
        let mut result: Vec<(String, Value)> = if self.incremental { base.to_vec() } else { Vec::new() };

        for (sign, term) in &self.terms {
            match (sign, term) {
                (Sign::Plus, Value::Map(entries)) => {
                    for (k, v) in entries {
                        match result.iter_mut().find(|(key, _)| key == k) {
                            Some(slot) => slot.1 = v.clone(),
                            None => result.push((k.clone(), v.clone())),
                        }
                    }
                }
                (Sign::Minus, Value::Map(entries)) => {
                    result.retain(|(k, _)| !entries.iter().any(|(key, _)| key == k));
                }
                (Sign::Minus, Value::List(keys)) => {
                    result.retain(|(k, _)| !keys.iter().any(|key| key.as_str() == Some(k)));
                }
                _ => return Err(LiteralError::NotAList("a mapping operand")),
            }
        }
        Ok(result)
    }
}

/// リテラル式を解析する。
pub fn parse(input: &str) -> Result<Expr, LiteralError> {
    let mut p = Parser {
        chars: input.chars().collect(),
        pos: 0,
    };
    p.skip_ws();

    let mut terms = Vec::new();
    let mut incremental = false;
    let first_sign = match p.peek() {
        // `-1` は符号付き整数であって差分式ではない
        Some('-') if p.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => Sign::Plus,
        Some('+') => {
            p.pos += 1;
            incremental = true;
            Sign::Plus
        }
        Some('-') => {
            p.pos += 1;
            incremental = true;
            Sign::Minus
        }
        _ => Sign::Plus,
    };
    p.skip_ws();
    terms.push((first_sign, p.parse_value()?));

    loop {
        p.skip_ws();
        let sign = match p.peek() {
            None => break,
            Some('+') => Sign::Plus,
            Some('-') => Sign::Minus,
            Some(c) => return Err(LiteralError::UnexpectedChar { found: c, offset: p.pos }),
        };
        p.pos += 1;
        p.skip_ws();
        terms.push((sign, p.parse_value()?));
    }

    Ok(Expr { incremental, terms })
}

/// 単一値として解析する（演算子なし）。
pub fn parse_value(input: &str) -> Result<Value, LiteralError> {
    let expr = parse(input)?;
    match expr.as_scalar() {
        Some(v) => Ok(v.clone()),
        None => {
            // 演算を含む式はリストとして評価する
            let (list, _) = expr.apply_list(&[])?;
            Ok(Value::List(list))
        }
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        match self.peek() {
            Some(c) if c == want => {
                self.pos += 1;
                Ok(())
            }
            Some(c) => Err(LiteralError::UnexpectedChar { found: c, offset: self.pos }),
            None => Err(LiteralError::UnexpectedEnd),
        }
    }

    fn parse_value(&mut self) -> Result<Value, LiteralError> {
        match self.peek() {
            None => Err(LiteralError::UnexpectedEnd),
            Some('\'') | Some('"') => self.parse_string().map(Value::Str),
            Some('[') => self.parse_list(),
            Some('{') => self.parse_map(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_int(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_bool(),
            Some(c) => Err(LiteralError::UnexpectedChar { found: c, offset: self.pos }),
        }
    }

    fn parse_string(&mut self) -> Result<String, LiteralError> {
        let quote = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
            self.pos += 1;
            match c {
                c if c == quote => return Ok(out),
                '\\' => {
                    let esc_at = self.pos - 1;
                    let e = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
                    self.pos += 1;
                    match e {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' | '\'' | '"' => out.push(e),
                        'x' => out.push(self.parse_hex_escape(2, esc_at)?),
                        'u' => out.push(self.parse_hex_escape(4, esc_at)?),
                        // 未知のエスケープはバックスラッシュごと保持する
                        other => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                c => out.push(c),
            }
        }
    }

    fn parse_hex_escape(&mut self, digits: usize, esc_at: usize) -> Result<char, LiteralError> {
        if self.pos + digits > self.chars.len() {
            return Err(LiteralError::BadEscape(esc_at));
        }
        let hex: String = self.chars[self.pos..self.pos + digits].iter().collect();
        let code = u32::from_str_radix(&hex, 16).map_err(|_| LiteralError::BadEscape(esc_at))?;
        self.pos += digits;
        char::from_u32(code).ok_or(LiteralError::BadEscape(esc_at))
    }

    fn parse_int(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| LiteralError::BadNumber(text))
    }

    fn parse_bool(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            _ => Err(LiteralError::UnexpectedChar {
                found: self.chars[start],
                offset: start,
            }),
        }
    }

    fn parse_list(&mut self) -> Result<Value, LiteralError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {}
                Some(c) => return Err(LiteralError::UnexpectedChar { found: c, offset: self.pos }),
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn parse_map(&mut self) -> Result<Value, LiteralError> {
        self.expect('{')?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                return Ok(Value::Map(entries));
            }
            let key = match self.parse_value()? {
                Value::Str(s) => s,
                _ => return Err(LiteralError::NonStringKey),
            };
            self.skip_ws();
            self.expect(':')?;
            self.skip_ws();
            let value = self.parse_value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some('}') => {}
                Some(c) => return Err(LiteralError::UnexpectedChar { found: c, offset: self.pos }),
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(list: &[Value]) -> Vec<String> {
        list.iter().filter_map(Value::to_text).collect()
    }

    // ── スカラー ──

    #[test]
    fn scalar_values() {
        assert_eq!(parse_value("42").unwrap(), Value::Int(42));
        assert_eq!(parse_value("-1").unwrap(), Value::Int(-1));
        assert_eq!(parse_value("True").unwrap(), Value::Bool(true));
        assert_eq!(parse_value("'abc'").unwrap(), Value::Str("abc".into()));
        assert_eq!(parse_value("\"a b\"").unwrap(), Value::Str("a b".into()));
    }

    #[test]
    fn negative_number_is_not_incremental() {
        let expr = parse("-1").unwrap();
        assert!(!expr.incremental);
        assert_eq!(expr.as_scalar(), Some(&Value::Int(-1)));
    }

    // ── リスト演算 ──

    #[test]
    fn list_union_and_difference() {
        let expr = parse("['ls', 'echo'] + ['cat', 'ls'] - ['echo']").unwrap();
        let (list, removed) = expr.apply_list(&[]).unwrap();
        assert_eq!(strs(&list), vec!["ls", "cat"]);
        assert_eq!(strs(&removed), vec!["echo"]);
    }

    #[test]
    fn unicode_escape_cancels_out() {
        let expr = parse(r"['\u003b'] - [';']").unwrap();
        let (list, _) = expr.apply_list(&[]).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn incremental_applies_to_base() {
        let base = vec![Value::Str("ls".into()), Value::Str("echo".into())];
        let expr = parse("+ ['ping'] - ['ls']").unwrap();
        assert!(expr.incremental);
        let (list, _) = expr.apply_list(&base).unwrap();
        assert_eq!(strs(&list), vec!["echo", "ping"]);
    }

    #[test]
    fn replacement_ignores_base() {
        let base = vec![Value::Str("ls".into())];
        let (list, _) = parse("['vim']").unwrap().apply_list(&base).unwrap();
        assert_eq!(strs(&list), vec!["vim"]);
    }

    #[test]
    fn all_sentinel_is_a_single_item() {
        let (list, _) = parse("'all'").unwrap().apply_list(&[]).unwrap();
        assert_eq!(strs(&list), vec!["all"]);
    }

    #[test]
    fn trailing_comma_and_whitespace() {
        let (list, _) = parse("  [ 'a' ,\n 'b', ]  ").unwrap().apply_list(&[]).unwrap();
        assert_eq!(strs(&list), vec!["a", "b"]);
    }

    // ── マッピング ──

    #[test]
    fn mapping_merge() {
        let base = vec![("ll".to_string(), Value::Str("ls -l".into()))];
        let expr = parse("+ {'la': 'ls -a', 'll': 'ls -lh'}").unwrap();
        let merged = expr.apply_map(&base).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], ("ll".to_string(), Value::Str("ls -lh".into())));
    }

    #[test]
    fn mapping_requires_string_keys() {
        assert_eq!(parse("{1: 'x'}"), Err(LiteralError::NonStringKey));
    }

    // ── エラー ──

    #[test]
    fn err_unterminated_string() {
        assert_eq!(parse("['ls"), Err(LiteralError::UnexpectedEnd));
    }

    #[test]
    fn err_trailing_garbage() {
        assert!(matches!(
            parse("['ls'] ls"),
            Err(LiteralError::UnexpectedChar { found: 'l', .. })
        ));
    }

    #[test]
    fn err_bad_escape() {
        assert_eq!(parse(r"'\u12'"), Err(LiteralError::BadEscape(1)));
    }

    #[test]
    fn err_list_algebra_on_mapping() {
        let expr = parse("{'a': 'b'} + ['c']").unwrap();
        assert!(expr.apply_list(&[]).is_err());
    }
}
