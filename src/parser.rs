//! コマンド分類器: 展開済みセグメントを語に分解し、代入・実行ファイル・引数・リダイレクトに分ける。
//!
//! ## 対応構文
//!
//! - クォート: シングル (`'...'`) / ダブル (`"..."`)。ここでクォートを除去する
//! - エスケープ: `\X`（裸ワード）, `\"` `\\` `\$` `` \` ``（ダブルクォート内）
//! - 先頭の代入: `NAME=value`（`NAME` は識別子、`=` はクォート外）
//! - リダイレクト: `>`, `>>`, `<`, `2>`, `N>&M`
//! - コマンド置換 `$(cmd)` / `` `cmd` `` はリテラル保持（実行器が展開）
//!
//! 演算子 `|` `;` `&` は [`lexer`](crate::lexer) が既に取り除いているはずなので、
//! クォート外に残っていたらエラーにする（変数の値から演算子が持ち込まれた場合など）。

// ── 出力 ────────────────────────────────────────────────────────────

/// 分類済みのセグメント。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Segment {
    /// 展開後・分類前のテキスト。
    pub raw: String,
    /// 先頭の `NAME=value` 列（出現順）。
    pub assignments: Vec<(String, String)>,
    /// 実行ファイル名。代入のみのセグメントでは `None`。
    pub executable: Option<String>,
    pub args: Vec<String>,
    /// `args` と同じ長さ。クォートやエスケープを含んだ語は glob/チルダ展開しない。
    pub quoted: Vec<bool>,
    pub redirects: Vec<Redirect>,
}

impl Segment {
    /// 代入のみのセグメントか。
    pub fn is_assignment_only(&self) -> bool {
        self.executable.is_none() && !self.assignments.is_empty()
    }

    /// `executable + args` を 1 つの Vec にする。
    pub fn argv(&self) -> Vec<String> {
        self.executable
            .iter()
            .chain(self.args.iter())
            .cloned()
            .collect()
    }
}

/// ファイルリダイレクト指定。
#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RedirectKind {
    /// `>`: stdout を上書き
    Output,
    /// `>>`: stdout を追記
    Append,
    /// `<`: stdin をファイルから読み取り
    Input,
    /// `2>`: stderr を上書き
    Stderr,
    /// `N>&M`: fd 複製（src_fd を dst_fd のコピーにする）
    FdDup { src_fd: i32, dst_fd: i32 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected EOF while looking for matching `{0}`")]
    UnterminatedQuote(char),
    #[error("syntax error: missing redirect target")]
    MissingRedirectTarget,
    #[error("syntax error near unexpected token `{0}`")]
    UnexpectedOperator(char),
    #[error("syntax error: invalid file descriptor in redirect")]
    BadFdRedirect,
}

// ── 語 ──────────────────────────────────────────────────────────────

/// クォート除去後の 1 語。
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    /// クォートまたはエスケープを含んでいた。
    pub quoted: bool,
    /// クォート外の `=` の位置（`text` 内のバイト位置）。左側が識別子のときだけ。
    pub assign_at: Option<usize>,
}

enum Token {
    Word(Word),
    Redirect(RedirectKind),
    FdDupPrefix(i32),
}

struct Tokenizer {
    chars: Vec<char>,
    pos: usize,
}

impl Tokenizer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    /// `$(` の `(` の直後から対応する `)` までを `buf` にコピーする。
    fn copy_paren(&mut self, buf: &mut String) {
        let end = crate::expand::find_closing_paren(&self.chars, self.pos);
        buf.extend(&self.chars[self.pos..end]);
        self.pos = end;
    }

    /// 開きバッククォートの直後から閉じまでを `buf` にコピーする。
    fn copy_backtick(&mut self, buf: &mut String) {
        let end = crate::expand::find_closing_backtick(&self.chars, self.pos);
        buf.extend(&self.chars[self.pos..end]);
        self.pos = end;
    }

    fn read_word(&mut self) -> Result<Word, ParseError> {
        let mut text = String::new();
        let mut quoted = false;
        let mut assign_at: Option<usize> = None;
        // ここまでの語がクォートなしの識別子か
        let mut ident_so_far = true;

        while let Some(c) = self.peek() {
            match c {
                c if c.is_whitespace() => break,
                '>' | '<' => break,
                '|' | ';' | '&' => return Err(ParseError::UnexpectedOperator(c)),
                '\'' => {
                    self.pos += 1;
                    quoted = true;
                    ident_so_far = false;
                    loop {
                        match self.peek() {
                            None => return Err(ParseError::UnterminatedQuote('\'')),
                            Some('\'') => {
                                self.pos += 1;
                                break;
                            }
                            Some(ch) => {
                                text.push(ch);
                                self.pos += 1;
                            }
                        }
                    }
                }
                '"' => {
                    self.pos += 1;
                    quoted = true;
                    ident_so_far = false;
                    loop {
                        match self.peek() {
                            None => return Err(ParseError::UnterminatedQuote('"')),
                            Some('"') => {
                                self.pos += 1;
                                break;
                            }
                            Some('\\') => {
                                match self.peek_at(1) {
                                    Some(next @ ('"' | '\\' | '$' | '`')) => text.push(next),
                                    Some(next) => {
                                        text.push('\\');
                                        text.push(next);
                                    }
                                    None => return Err(ParseError::UnterminatedQuote('"')),
                                }
                                self.pos += 2;
                            }
                            Some('`') => {
                                text.push('`');
                                self.pos += 1;
                                self.copy_backtick(&mut text);
                            }
                            Some('$') if self.peek_at(1) == Some('(') => {
                                text.push_str("$(");
                                self.pos += 2;
                                self.copy_paren(&mut text);
                            }
                            Some(ch) => {
                                text.push(ch);
                                self.pos += 1;
                            }
                        }
                    }
                }
                '\\' => {
                    quoted = true;
                    ident_so_far = false;
                    match self.peek_at(1) {
                        Some(next) => {
                            text.push(next);
                            self.pos += 2;
                        }
                        None => {
                            text.push('\\');
                            self.pos += 1;
                        }
                    }
                }
                '`' => {
                    ident_so_far = false;
                    text.push('`');
                    self.pos += 1;
                    self.copy_backtick(&mut text);
                }
                '$' if self.peek_at(1) == Some('(') => {
                    ident_so_far = false;
                    text.push_str("$(");
                    self.pos += 2;
                    self.copy_paren(&mut text);
                }
                '=' if assign_at.is_none() && ident_so_far && !text.is_empty() => {
                    assign_at = Some(text.len());
                    ident_so_far = false;
                    text.push('=');
                    self.pos += 1;
                }
                _ => {
                    if ident_so_far {
                        let ok = if text.is_empty() {
                            c.is_ascii_alphabetic() || c == '_'
                        } else {
                            c.is_ascii_alphanumeric() || c == '_'
                        };
                        ident_so_far = ok;
                    }
                    text.push(c);
                    self.pos += 1;
                }
            }
        }

        Ok(Word {
            text,
            quoted,
            assign_at,
        })
    }

    fn next_token(&mut self) -> Option<Result<Token, ParseError>> {
        self.skip_whitespace();
        let ch = self.peek()?;
        let token = match ch {
            '>' if self.peek_at(1) == Some('>') => {
                self.pos += 2;
                Token::Redirect(RedirectKind::Append)
            }
            '>' if self.peek_at(1) == Some('&') => {
                self.pos += 2;
                Token::FdDupPrefix(1)
            }
            '>' => {
                self.pos += 1;
                Token::Redirect(RedirectKind::Output)
            }
            '<' => {
                self.pos += 1;
                Token::Redirect(RedirectKind::Input)
            }
            // トークン先頭の `2>` のみ。`file2>` 等の途中は語として読まれる。
            '2' if self.peek_at(1) == Some('>') && self.peek_at(2) == Some('&') => {
                self.pos += 3;
                Token::FdDupPrefix(2)
            }
            '2' if self.peek_at(1) == Some('>') => {
                self.pos += 2;
                Token::Redirect(RedirectKind::Stderr)
            }
            _ => return Some(self.read_word().map(Token::Word)),
        };
        Some(Ok(token))
    }
}

/// セグメントを語に分解する。代入・実行ファイル・引数・リダイレクト先の順。検証器がパス検査に使う。
pub fn words(text: &str) -> Result<Vec<Word>, ParseError> {
    let segment = classify(text)?;
    let mut out = Vec::new();
    for (name, value) in &segment.assignments {
        out.push(Word {
            text: format!("{name}={value}"),
            quoted: false,
            assign_at: Some(name.len()),
        });
    }
    if let Some(exe) = &segment.executable {
        out.push(Word {
            text: exe.clone(),
            quoted: false,
            assign_at: None,
        });
    }
    for (arg, &quoted) in segment.args.iter().zip(&segment.quoted) {
        out.push(Word {
            text: arg.clone(),
            quoted,
            assign_at: None,
        });
    }
    for redirect in &segment.redirects {
        if !matches!(redirect.kind, RedirectKind::FdDup { .. }) {
            out.push(Word {
                text: redirect.target.clone(),
                quoted: false,
                assign_at: None,
            });
        }
    }
    Ok(out)
}

// ── 分類 ────────────────────────────────────────────────────────────

/// 展開済みセグメントを分類する。
///
/// 先頭の `NAME=value` 語を代入として取り出し、最初の非代入語を実行ファイル、残りを引数にする。
pub fn classify(text: &str) -> Result<Segment, ParseError> {
    let mut tokenizer = Tokenizer::new(text);
    let mut segment = Segment {
        raw: text.to_string(),
        ..Segment::default()
    };

    while let Some(token) = tokenizer.next_token() {
        match token? {
            Token::Word(word) => {
                if segment.executable.is_none() {
                    if let Some(at) = word.assign_at {
                        let name = word.text[..at].to_string();
                        let value = word.text[at + 1..].to_string();
                        segment.assignments.push((name, value));
                        continue;
                    }
                    segment.executable = Some(word.text);
                } else {
                    segment.args.push(word.text);
                    segment.quoted.push(word.quoted);
                }
            }
            Token::Redirect(kind) => {
                let target = match tokenizer.next_token() {
                    Some(Ok(Token::Word(w))) => w.text,
                    Some(Err(e)) => return Err(e),
                    _ => return Err(ParseError::MissingRedirectTarget),
                };
                segment.redirects.push(Redirect { kind, target });
            }
            Token::FdDupPrefix(src_fd) => {
                let dst_fd = match tokenizer.next_token() {
                    Some(Ok(Token::Word(w))) => w.text.parse::<i32>().map_err(|_| ParseError::BadFdRedirect)?,
                    Some(Err(e)) => return Err(e),
                    _ => return Err(ParseError::BadFdRedirect),
                };
                segment.redirects.push(Redirect {
                    kind: RedirectKind::FdDup { src_fd, dst_fd },
                    target: String::new(),
                });
            }
        }
    }

    Ok(segment)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(text: &str) -> Vec<String> {
        classify(text).unwrap().argv()
    }

    // ── 基本 ──

    #[test]
    fn simple_command() {
        let seg = classify("ls -la /tmp").unwrap();
        assert_eq!(seg.executable.as_deref(), Some("ls"));
        assert_eq!(seg.args, vec!["-la", "/tmp"]);
        assert!(seg.assignments.is_empty());
    }

    #[test]
    fn rejoin_preserves_argument_order() {
        let text = "grep -n pattern file.txt other.txt";
        assert_eq!(argv(text).join(" "), text);
    }

    #[test]
    fn extra_whitespace() {
        assert_eq!(argv("  echo   a    b  "), vec!["echo", "a", "b"]);
    }

    #[test]
    fn empty_input() {
        let seg = classify("   ").unwrap();
        assert!(seg.executable.is_none());
        assert!(!seg.is_assignment_only());
    }

    // ── クォート ──

    #[test]
    fn single_quotes() {
        assert_eq!(argv("echo 'hello world'"), vec!["echo", "hello world"]);
    }

    #[test]
    fn double_quotes_with_escapes() {
        assert_eq!(argv(r#"echo "a \"b\" \\ \n""#), vec!["echo", r#"a "b" \ \n"#]);
    }

    #[test]
    fn empty_quotes() {
        assert_eq!(argv("echo ''"), vec!["echo", ""]);
    }

    #[test]
    fn adjacent_quotes_concatenate() {
        assert_eq!(argv(r#"echo a'b'"c""#), vec!["echo", "abc"]);
    }

    #[test]
    fn quoted_flag_tracked() {
        let seg = classify("ls '*.rs' *.rs \\*").unwrap();
        assert_eq!(seg.quoted, vec![true, false, true]);
    }

    #[test]
    fn substitution_kept_literal() {
        assert_eq!(argv("echo $(ls 'a b')"), vec!["echo", "$(ls 'a b')"]);
        assert_eq!(argv("echo `ls`x"), vec!["echo", "`ls`x"]);
    }

    // ── 代入 ──

    #[test]
    fn leading_assignments() {
        let seg = classify("A=1 B=two echo ok").unwrap();
        assert_eq!(
            seg.assignments,
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "two".to_string())]
        );
        assert_eq!(seg.executable.as_deref(), Some("echo"));
        assert_eq!(seg.args, vec!["ok"]);
    }

    #[test]
    fn assignment_only() {
        let seg = classify("PATH=/tmp").unwrap();
        assert!(seg.is_assignment_only());
        assert_eq!(seg.assignments[0], ("PATH".to_string(), "/tmp".to_string()));
    }

    #[test]
    fn quoted_assignment_value() {
        let seg = classify(r#"MSG="a b" env"#).unwrap();
        assert_eq!(seg.assignments[0].1, "a b");
        assert_eq!(seg.executable.as_deref(), Some("env"));
    }

    #[test]
    fn equals_after_command_is_argument() {
        let seg = classify("env A=1").unwrap();
        assert!(seg.assignments.is_empty());
        assert_eq!(seg.args, vec!["A=1"]);
    }

    #[test]
    fn non_identifier_is_not_assignment() {
        let seg = classify("1A=x").unwrap();
        assert_eq!(seg.executable.as_deref(), Some("1A=x"));
        let seg = classify("'A'=x").unwrap();
        assert_eq!(seg.executable.as_deref(), Some("A=x"));
        let seg = classify("=x").unwrap();
        assert_eq!(seg.executable.as_deref(), Some("=x"));
    }

    // ── リダイレクト ──

    #[test]
    fn redirects() {
        let seg = classify("sort < in.txt > out.txt 2> err.txt").unwrap();
        assert_eq!(seg.argv(), vec!["sort"]);
        assert_eq!(seg.redirects.len(), 3);
        assert_eq!(seg.redirects[0].kind, RedirectKind::Input);
        assert_eq!(seg.redirects[1].target, "out.txt");
        assert_eq!(seg.redirects[2].kind, RedirectKind::Stderr);
    }

    #[test]
    fn redirect_append_no_space() {
        let seg = classify("echo hi >>log").unwrap();
        assert_eq!(seg.redirects[0].kind, RedirectKind::Append);
        assert_eq!(seg.redirects[0].target, "log");
    }

    #[test]
    fn fd_dup() {
        let seg = classify("cmd 2>&1").unwrap();
        assert_eq!(seg.redirects[0].kind, RedirectKind::FdDup { src_fd: 2, dst_fd: 1 });
    }

    // ── エラー ──

    #[test]
    fn err_unterminated_quote() {
        assert_eq!(classify("echo 'abc"), Err(ParseError::UnterminatedQuote('\'')));
        assert_eq!(classify("echo \"abc"), Err(ParseError::UnterminatedQuote('"')));
    }

    #[test]
    fn err_missing_redirect_target() {
        assert_eq!(classify("echo >"), Err(ParseError::MissingRedirectTarget));
        assert_eq!(classify("echo > > x"), Err(ParseError::MissingRedirectTarget));
    }

    #[test]
    fn err_bad_fd() {
        assert_eq!(classify("cmd 2>&x"), Err(ParseError::BadFdRedirect));
    }

    #[test]
    fn err_smuggled_operator() {
        assert_eq!(classify("echo a;b"), Err(ParseError::UnexpectedOperator(';')));
        assert_eq!(classify("echo a|b"), Err(ParseError::UnexpectedOperator('|')));
    }

    #[test]
    fn quoted_operator_is_fine() {
        assert_eq!(argv("echo 'a;b' \"c|d\" e\\&f"), vec!["echo", "a;b", "c|d", "e&f"]);
    }

    // ── words ──

    #[test]
    fn words_include_assignments_and_redirect_targets() {
        let w = words("A=1 cat f > out 2>&1").unwrap();
        let texts: Vec<&str> = w.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, vec!["A=1", "cat", "f", "out"]);
    }
}
