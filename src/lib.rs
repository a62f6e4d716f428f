//! rlsh ライブラリ: バイナリ・統合テスト・ベンチマークから使うモジュールを公開する。
//!
//! バイナリ本体は `main.rs` の起動処理と REPL ループ。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`config`] | TOML 設定の読み込みと `[default]` → `grp:` → ユーザーの順の上書き解決 |
//! | [`literal`] | 設定値のリテラル式（リスト・辞書・`+`/`-` 演算・`'all'`） |
//! | [`policy`] | 解決済みポリシー（許可コマンド、パス前方一致 matcher、sudo、overssh 等） |
//! | [`lexer`] | 行をクォート尊重で「セグメント + 演算子」に分割、継続行の判定 |
//! | [`expand`] | エイリアス展開と変数展開（`$NAME`, `${NAME}`, `$?`） |
//! | [`parser`] | 展開済みセグメントの分類（代入・実行ファイル・引数・リダイレクト） |
//! | [`path`] | チルダ・glob 展開、シンボリックリンクを辿る正規化 |
//! | [`validate`] | 検証器（制御文字、禁止文字、コマンド、sudo、パス、拡張子、環境変数） |
//! | [`violation`] | 警告カウンタの状態機械（strict / quiet / 無制限） |
//! | [`executor`] | 検証済みの行の実行（`&&`/`||`/`;`/`&`、パイプライン、コマンド置換） |
//! | [`builtins`] | ビルトイン（`cd`, `exit`, `export`, `source`, `history`, `lpath`, `lsudo`, `help`, `jobs`, `fg`, `bg`） |
//! | [`job`] | ジョブテーブル、foreground 待機、完了通知 |
//! | [`spawn`] | `posix_spawnp` ラッパー（プロセスグループ、シグナル既定化、環境の上書き） |
//! | [`signal`] | ジョブ制御シグナルの無視とアイドルタイマー |
//! | [`shell`] | セッション状態とプロンプト |
//! | [`history`] | 履歴ファイルの永続化と `history` の出力 |
//! | [`complete`] | rustyline 用の補完（許可コマンドと許可パスだけを候補にする） |
//! | [`ssh`] | SSH 強制コマンド（`overssh`、scp、sftp-server） |
//! | [`logging`] | tracing の出力先設定と監査イベント |

pub mod builtins;
pub mod complete;
pub mod config;
pub mod executor;
pub mod expand;
pub mod history;
pub mod job;
pub mod lexer;
pub mod literal;
pub mod logging;
pub mod parser;
pub mod path;
pub mod policy;
pub mod shell;
pub mod signal;
pub mod spawn;
pub mod ssh;
pub mod validate;
pub mod violation;
