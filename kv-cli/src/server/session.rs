use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use log::info;
use rustyline::config::Builder;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Editor};
use tokio::time::Instant;

use kv_rs::facade::{KvFacade, LeaseFacade, MaintenanceFacade, WatchFacade};
use kv_rs::row::rows::ServerStats;
use kv_rs::storage::memory::Memory;
use kv_rs::store::Store;
use kv_rs::txn::{Compare, CompareOp, CompareTarget, TxnOp};
use kv_rs::watch::WatchOptions;

use crate::ast::token_kind::TokenKind;
use crate::ast::tokenizer::{Token, Tokenizer};
use crate::rusty::CliHelper;
use crate::server::config::{ConfigLoad, DEFAULT_PROMPT};
use crate::show::Show;

/// Session and kv storage cmd and running
pub struct Session {
    is_repl: bool,

    running: Arc<AtomicBool>,
    store: Arc<Store<Memory>>,

    settings: ConfigLoad,
    query: String,
    in_comment_block: bool,

    keywords: Arc<Vec<String>>,
}

impl Session {
    pub async fn try_new(settings: ConfigLoad, is_repl: bool, running: Arc<AtomicBool>) -> Result<Self> {
        if is_repl {
            println!("Welcome to {}.", DEFAULT_PROMPT);
            println!("Connecting to Client.");
            println!();
        }

        let store = Store::new_memory(settings.store.clone())?;
        let keywords = crate::ast::tokenizer::all_reserved_keywords();

        Ok(Self {
            is_repl,
            running,
            store,
            settings,
            query: String::new(),
            in_comment_block: false,
            keywords: Arc::new(keywords),
        })
    }

    async fn prompt(&self) -> String {
        if !self.query.trim().is_empty() {
            format!("{} > ", DEFAULT_PROMPT)
        } else if let Some(prompt) = self.settings.prompt.as_ref() {
            format!("{} > ", prompt.trim_end())
        } else {
            format!("{} > ", DEFAULT_PROMPT)
        }
    }

    pub async fn handle_repl(&mut self) {
        let config = Builder::new().completion_prompt_limit(5).completion_type(CompletionType::Circular).build();
        let mut rl = Editor::<CliHelper, DefaultHistory>::with_config(config).unwrap();

        rl.set_helper(Some(CliHelper::with_keywords(self.keywords.clone())));
        rl.load_history(&get_history_path()).ok();

        'F: loop {
            if !self.running.load(Ordering::SeqCst) {
                break 'F;
            }

            match rl.readline(&self.prompt().await) {
                Ok(line) => {
                    let queries = self.append_query(&line);
                    for query in queries {
                        let _ = rl.add_history_entry(&query);
                        match self.handle_query(true, &query).await {
                            Ok(None) => break 'F,
                            Ok(Some(_)) => {}
                            Err(e) => {
                                eprintln!("error: {}", e);
                                self.query.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) => match e {
                    ReadlineError::Io(err) => eprintln!("io err: {err}"),
                    ReadlineError::Interrupted => {
                        println!("^C");
                        self.query.clear();
                        self.running.store(false, Ordering::SeqCst);
                    }
                    ReadlineError::Eof => break,
                    _ => {}
                },
            }
        }

        self.store.shutdown();
        println!("Bye~");
        let _ = rl.save_history(&get_history_path());
    }

    pub async fn handle_reader<R: BufRead>(&mut self, r: R) -> Result<()> {
        let start = Instant::now();
        let mut lines = r.lines();
        let mut stats: Option<ServerStats> = None;

        loop {
            match lines.next() {
                Some(Ok(line)) => {
                    let queries = self.append_query(&line);
                    for query in queries {
                        stats = self.handle_query(false, &query).await?;
                    }
                }
                Some(Err(e)) => return Err(anyhow!("read lines err: {}", e)),
                None => break,
            }
        }

        let query = self.query.trim().to_owned();
        if !query.is_empty() {
            self.query.clear();
            stats = self.handle_query(false, &query).await?;
        }
        let _ = stats;

        println!("{:.3}", start.elapsed().as_secs_f64());
        self.store.shutdown();

        Ok(())
    }

    /// Appends a partial line to the in-flight query, splitting on
    /// unescaped, uncommented semicolons so one `readline` call can submit
    /// several statements and one statement can span several lines.
    fn append_query(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();
        if line.is_empty() {
            return vec![];
        }

        if !self.settings.get_auto_append_part_cmd() {
            return vec![line.to_owned()];
        }

        if self.query.is_empty() && (line.starts_with('.') || line == "exit" || line == "quit") {
            return vec![line.to_owned()];
        }

        if let Some(false) = self.settings.multi_line {
            return if line.starts_with("--") { vec![] } else { vec![line.to_owned()] };
        }

        self.query.push(' ');

        let mut queries = Vec::new();
        let mut tokenizer = Tokenizer::new(line);
        let mut in_comment = false;
        let mut start = 0;
        let mut comment_block_start = 0;

        while let Some(Ok(token)) = tokenizer.next() {
            match token.kind {
                TokenKind::SemiColon => {
                    if in_comment || self.in_comment_block {
                        continue;
                    }
                    let mut sql = self.query.trim().to_owned();
                    if sql.is_empty() {
                        continue;
                    }
                    sql.push(';');
                    queries.push(sql);
                    self.query.clear();
                }
                TokenKind::Comment => in_comment = true,
                TokenKind::EOI => in_comment = false,
                TokenKind::Newline => {
                    in_comment = false;
                    self.query.push('\n');
                }
                TokenKind::CommentBlockStart => {
                    if !self.in_comment_block {
                        comment_block_start = token.span.start;
                    }
                    self.in_comment_block = true;
                }
                TokenKind::CommentBlockEnd => {
                    self.in_comment_block = false;
                    self.query.push_str(&line[comment_block_start..token.span.end]);
                }
                _ => {
                    if !in_comment && !self.in_comment_block {
                        self.query.push_str(&line[start..token.span.end]);
                    }
                }
            }
            start = token.span.end;
        }

        if self.in_comment_block {
            self.query.push_str(&line[comment_block_start..]);
        }

        queries
    }

    async fn handle_query(&mut self, is_repl: bool, query: &str) -> Result<Option<ServerStats>> {
        let query = query.trim_end_matches(';').trim();
        if query.is_empty() {
            return Ok(Some(ServerStats::default()));
        }
        if is_repl && (query == "exit" || query == "quit") {
            return Ok(None);
        }

        if is_repl && query.starts_with('.') {
            let parts = query.trim_start_matches('.').split_whitespace().collect::<Vec<_>>();
            if parts.len() != 2 {
                return Err(anyhow!("Control command error, must be syntax of `.cmd_name cmd_value`."));
            }
            self.settings.inject_cmd(parts[0], parts[1])?;
            info!("refresh config: {:?}", &self.settings);
            eprintln!("Refresh Config OK ~");
            return Ok(Some(ServerStats::default()));
        }

        let mut tokenizer = Tokenizer::new(query);
        let mut token_list = Vec::<Token>::new();
        while let Some(Ok(token)) = tokenizer.next() {
            if token.kind != TokenKind::EOI {
                token_list.push(token);
            }
        }
        if token_list.is_empty() {
            return Ok(Some(ServerStats::default()));
        }

        self.dispatch(is_repl, token_list).await
    }

    async fn dispatch(&mut self, is_repl: bool, tokens: Vec<Token<'_>>) -> Result<Option<ServerStats>> {
        let kind = QueryKind::try_from(tokens[0].kind).map_err(|e| anyhow!(e))?;
        let start = Instant::now();
        let args: Vec<String> = tokens[1..].iter().map(token_value).collect();
        let show = Show::new_with_start(self.settings.is_show_affected(), is_repl, start);

        match kind {
            QueryKind::Exit => return Ok(None),

            QueryKind::Info | QueryKind::Status => {
                let status = self.store.raft_status();
                if is_repl {
                    eprintln!(
                        "node_id={} term={} leader_id={} state={:?} applied_index={} current_revision={}",
                        status.id, status.term, status.leader_id, status.state, status.applied_index, self.store.current_revision()
                    );
                }
                show.output(1);
            }

            QueryKind::Time => {
                if is_repl {
                    let now: DateTime<Local> = Local::now();
                    eprintln!("{}", now.format("%Y-%m-%d %H:%M:%S%.3f"));
                }
                show.output(1);
            }

            QueryKind::KSize => {
                let range = self.store.range(b"\x00", b"", 0, 0).await?;
                if is_repl {
                    eprintln!("{}", range.count);
                }
                show.output(range.count as i64);
            }

            QueryKind::Keys => {
                let range = self.store.range(b"\x00", b"", 0, 0).await?;
                if is_repl {
                    for kv in &range.kvs {
                        eprintln!("{}", String::from_utf8_lossy(&kv.key));
                    }
                }
                show.output(range.kvs.len() as i64);
            }

            QueryKind::Put | QueryKind::Set => {
                if args.len() < 2 || args.len() > 3 {
                    eprintln!("put args are invalid, expected `PUT key value [lease_id]`");
                    return Ok(Some(ServerStats::default()));
                }
                let lease_id = if args.len() == 3 { args[2].parse()? } else { 0 };
                let resp = self.store.put(args[0].as_bytes(), args[1].clone().into_bytes(), lease_id).await?;
                if is_repl {
                    eprintln!("OK ~ (revision {})", resp.revision);
                }
                show.output(1);
            }

            QueryKind::SetEx => {
                if args.len() != 3 {
                    eprintln!("setex args are invalid, expected `SETEX key ttl_seconds value`");
                    return Ok(Some(ServerStats::default()));
                }
                let ttl: i64 = args[1].parse()?;
                let lease_id = monotonic_lease_id();
                self.store.lease_grant(lease_id, ttl).await?;
                let resp = self.store.put(args[0].as_bytes(), args[2].clone().into_bytes(), lease_id).await?;
                if is_repl {
                    eprintln!("OK ~ (revision {}, lease {})", resp.revision, lease_id);
                }
                show.output(1);
            }

            QueryKind::Get => {
                if args.len() != 1 {
                    eprintln!("get args are invalid, must be 1 argument");
                    return Ok(Some(ServerStats::default()));
                }
                let range_end = successor(args[0].as_bytes());
                let resp = self.store.range(args[0].as_bytes(), &range_end, 1, 0).await?;
                if is_repl {
                    match resp.kvs.first() {
                        Some(kv) => eprintln!("{}", String::from_utf8_lossy(&kv.value)),
                        None => eprintln!("N/A ~"),
                    }
                }
                show.output(1);
            }

            QueryKind::Range => {
                if args.is_empty() || args.len() > 3 {
                    eprintln!("range args are invalid, expected `RANGE start [end] [limit]`");
                    return Ok(Some(ServerStats::default()));
                }
                let end = args.get(1).map(|s| s.as_bytes().to_vec()).unwrap_or_default();
                let limit: usize = args.get(2).map(|s| s.parse()).transpose()?.unwrap_or(0);
                let resp = self.store.range(args[0].as_bytes(), &end, limit, 0).await?;
                if is_repl {
                    for kv in &resp.kvs {
                        eprintln!("{} => {}", String::from_utf8_lossy(&kv.key), String::from_utf8_lossy(&kv.value));
                    }
                    eprintln!("({} of {} matched, more={})", resp.kvs.len(), resp.count, resp.more);
                }
                show.output(resp.kvs.len() as i64);
            }

            QueryKind::Del => {
                if args.len() != 1 {
                    eprintln!("del args are invalid, must be 1 argument");
                    return Ok(Some(ServerStats::default()));
                }
                let resp = self.store.delete_range(args[0].as_bytes(), b"").await?;
                if is_repl {
                    eprintln!("OK ~ ({} deleted)", resp.deleted_count);
                }
                show.output(resp.deleted_count);
            }

            QueryKind::DelRange => {
                if args.len() != 2 {
                    eprintln!("delrange args are invalid, expected `DELRANGE start end`");
                    return Ok(Some(ServerStats::default()));
                }
                let resp = self.store.delete_range(args[0].as_bytes(), args[1].as_bytes()).await?;
                if is_repl {
                    eprintln!("OK ~ ({} deleted)", resp.deleted_count);
                }
                show.output(resp.deleted_count);
            }

            QueryKind::Txn => {
                let result = self.run_txn(&args).await?;
                if is_repl {
                    eprintln!("succeeded={} revision={}", result.succeeded, result.revision.main);
                }
                show.output(1);
            }

            QueryKind::Compact => {
                if args.len() != 1 {
                    eprintln!("compact args are invalid, expected `COMPACT revision`");
                    return Ok(Some(ServerStats::default()));
                }
                let revision: i64 = args[0].parse()?;
                self.store.compact(revision).await?;
                if is_repl {
                    eprintln!("OK ~ compacted below {}", revision);
                }
                show.output(1);
            }

            QueryKind::Watch => {
                if args.is_empty() {
                    eprintln!("watch args are invalid, expected `WATCH key [range_end]`");
                    return Ok(Some(ServerStats::default()));
                }
                let range_end = args.get(1).map(|s| s.as_bytes().to_vec()).unwrap_or_default();
                self.run_watch(args[0].as_bytes().to_vec(), range_end, is_repl).await?;
                show.output(1);
            }

            QueryKind::Lease => {
                self.run_lease(&args, is_repl).await?;
                show.output(1);
            }
        }

        Ok(Some(ServerStats::default()))
    }

    async fn run_txn(&self, args: &[String]) -> Result<kv_rs::txn::TxnResult> {
        // `TXN IF key op value THEN PUT k v|DEL k ELSE PUT k v|DEL k`: a
        // single compare predicate with a single op per branch, the subset
        // a keyword-driven REPL can express without a full expression
        // grammar.
        if args.len() < 8 || args[0].to_uppercase() != "IF" {
            return Err(anyhow!("txn args are invalid, expected `TXN IF key op value THEN <op> ELSE <op>`"));
        }
        let compare = Compare {
            key: args[1].clone().into_bytes(),
            target: CompareTarget::Value,
            op: parse_compare_op(&args[2])?,
            value: args[3].clone().into_bytes(),
        };
        let then_idx = args.iter().position(|a| a.to_uppercase() == "THEN").ok_or_else(|| anyhow!("missing THEN"))?;
        let else_idx = args.iter().position(|a| a.to_uppercase() == "ELSE").ok_or_else(|| anyhow!("missing ELSE"))?;
        let then_op = parse_txn_op(&args[then_idx + 1..else_idx])?;
        let else_op = parse_txn_op(&args[else_idx + 1..])?;

        Ok(self.store.txn(vec![compare], vec![then_op], vec![else_op]).await?)
    }

    async fn run_watch(&self, key: Vec<u8>, range_end: Vec<u8>, is_repl: bool) -> Result<()> {
        let (watch_id, mut rx) = self.store.watch(key, range_end, 0, WatchOptions::default()).await?;
        if is_repl {
            eprintln!("watching (id={}), Ctrl+C to stop", watch_id);
        }
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(event)) => {
                    if is_repl {
                        eprintln!(
                            "{:?} {} => {} (revision {})",
                            event.event_type,
                            String::from_utf8_lossy(&event.kv.key),
                            String::from_utf8_lossy(&event.kv.value),
                            event.revision.main
                        );
                    }
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        self.store.cancel_watch(watch_id);
        Ok(())
    }

    async fn run_lease(&self, args: &[String], is_repl: bool) -> Result<()> {
        if args.is_empty() {
            return Err(anyhow!("lease args are invalid, expected `LEASE GRANT|REVOKE|RENEW|TTL|LIST ...`"));
        }
        match args[0].to_uppercase().as_str() {
            "GRANT" => {
                if args.len() != 2 {
                    return Err(anyhow!("expected `LEASE GRANT ttl_seconds`"));
                }
                let ttl: i64 = args[1].parse()?;
                let id = monotonic_lease_id();
                let lease = self.store.lease_grant(id, ttl).await?;
                if is_repl {
                    eprintln!("granted lease {} ttl={}s", lease.id, lease.ttl_seconds);
                }
            }
            "REVOKE" => {
                if args.len() != 2 {
                    return Err(anyhow!("expected `LEASE REVOKE id`"));
                }
                self.store.lease_revoke(args[1].parse()?).await?;
                if is_repl {
                    eprintln!("OK ~");
                }
            }
            "RENEW" => {
                if args.len() != 2 {
                    return Err(anyhow!("expected `LEASE RENEW id`"));
                }
                let ttl = self.store.lease_renew(args[1].parse()?).await?;
                if is_repl {
                    eprintln!("remaining ttl={}s", ttl);
                }
            }
            "TTL" => {
                if args.len() != 2 {
                    return Err(anyhow!("expected `LEASE TTL id`"));
                }
                let ttl = self.store.lease_time_to_live(args[1].parse()?).await?;
                if is_repl {
                    eprintln!("{}", ttl);
                }
            }
            "LIST" => {
                let leases = self.store.leases().await?;
                if is_repl {
                    for lease in &leases {
                        eprintln!("lease {} ttl={}s keys={}", lease.id, lease.ttl_seconds, lease.keys.len());
                    }
                }
            }
            other => return Err(anyhow!("unknown lease subcommand: {}", other)),
        }
        Ok(())
    }
}

fn parse_compare_op(s: &str) -> Result<CompareOp> {
    match s {
        "=" | "==" => Ok(CompareOp::Eq),
        "!=" | "<>" => Ok(CompareOp::Ne),
        "<" => Ok(CompareOp::Lt),
        ">" => Ok(CompareOp::Gt),
        other => Err(anyhow!("unsupported compare operator: {}", other)),
    }
}

fn parse_txn_op(tokens: &[String]) -> Result<TxnOp> {
    match tokens.first().map(|s| s.to_uppercase()).as_deref() {
        Some("PUT") if tokens.len() == 3 => {
            Ok(TxnOp::Put { key: tokens[1].clone().into_bytes(), value: tokens[2].clone().into_bytes(), lease: 0 })
        }
        Some("DEL") if tokens.len() == 2 => Ok(TxnOp::Delete { key: tokens[1].clone().into_bytes() }),
        _ => Err(anyhow!("unsupported txn branch op, expected `PUT key value` or `DEL key`")),
    }
}

/// A process-local, monotonically increasing lease id so the REPL doesn't
/// need the caller to invent one. Scoped to this session only.
fn monotonic_lease_id() -> i64 {
    use std::sync::atomic::AtomicI64;
    static NEXT: AtomicI64 = AtomicI64::new(1);
    NEXT.fetch_add(1, Ordering::SeqCst)
}

/// The smallest key strictly greater than `key` under byte-lexicographic
/// order, i.e. the standard "single key as a range" trick: `[key, succ(key))`
/// matches exactly `key`. Mirrors the prefix-increment in
/// `storage::engine::Engine::scan_prefix`.
fn successor(key: &[u8]) -> Vec<u8> {
    match key.iter().rposition(|b| *b != 0xff) {
        Some(i) => key.iter().take(i).copied().chain(std::iter::once(key[i] + 1)).collect(),
        None => Vec::new(),
    }
}

fn token_value(token: &Token<'_>) -> String {
    let text = token.text();
    if token.kind == TokenKind::QuotedString && text.len() >= 2 {
        text[1..text.len() - 1].to_string()
    } else {
        text.to_string()
    }
}

fn get_history_path() -> String {
    format!("{}/.kvcli_history", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum QueryKind {
    Info,
    Status,
    Time,
    KSize,
    Exit,
    Keys,
    Put,
    Set,
    SetEx,
    Get,
    Range,
    Del,
    DelRange,
    Txn,
    Watch,
    Lease,
    Compact,
}

impl TryFrom<TokenKind> for QueryKind {
    type Error = String;

    #[inline(always)]
    fn try_from(kind: TokenKind) -> std::result::Result<Self, Self::Error> {
        match kind {
            TokenKind::TIME => Ok(QueryKind::Time),
            TokenKind::GET => Ok(QueryKind::Get),
            TokenKind::SET => Ok(QueryKind::Set),
            TokenKind::SETEX => Ok(QueryKind::SetEx),
            TokenKind::PUT => Ok(QueryKind::Put),
            TokenKind::RANGE => Ok(QueryKind::Range),
            TokenKind::DEL | TokenKind::DELETE => Ok(QueryKind::Del),
            TokenKind::DELRANGE => Ok(QueryKind::DelRange),
            TokenKind::TXN => Ok(QueryKind::Txn),
            TokenKind::WATCH => Ok(QueryKind::Watch),
            TokenKind::LEASE => Ok(QueryKind::Lease),
            TokenKind::COMPACT => Ok(QueryKind::Compact),
            TokenKind::INFO => Ok(QueryKind::Info),
            TokenKind::STATUS => Ok(QueryKind::Status),
            TokenKind::KSize => Ok(QueryKind::KSize),
            TokenKind::KEYS => Ok(QueryKind::Keys),
            TokenKind::EXIT => Ok(QueryKind::Exit),
            _ => Err("UnSupport cmd".to_owned()),
        }
    }
}
