//! Statement dispatch.
//!
//! The server answers a handful of branch statements itself; everything else
//! is forwarded to the [`QueryEngine`] together with the session's active
//! branch. Recognised statements (keywords are case-insensitive, a trailing
//! `;` is ignored):
//!
//! ```text
//! SELECT active_branch() [AS alias]
//! SELECT @@global.default_branch
//! SET GLOBAL default_branch = '<ref>'
//! SET @@global.default_branch = '<ref>'
//! SELECT checkout('<ref>')          | CALL checkout('<ref>')
//! SELECT checkout('-b', '<name>')   | CALL checkout('-b', '<name>')
//! ```

use crate::config::ServerConfig;
use crate::engine::{BranchStore, QueryEngine, QueryResult, StatementContext};
use crate::error::StatementError;
use crate::session::{BranchRef, DefaultBranch, Session};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACTIVE_BRANCH_COLUMN: &str = "active_branch()";
const DEFAULT_BRANCH_VARIABLE: &str = "@@global.default_branch";
const STATUS_COLUMN: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Symbol(char),
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn is_symbol(&self, symbol: char) -> bool {
        matches!(self, Token::Symbol(c) if *c == symbol)
    }
}

/// Splits a statement into words, quoted strings and symbols.
///
/// Returns `None` for input it cannot tokenize (unterminated quotes, unknown
/// punctuation); such statements are left to the engine.
fn tokenize(sql: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' || c == '`' {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next()? {
                    q if q == c => {
                        // A doubled quote is an escaped quote.
                        if chars.peek() == Some(&c) {
                            chars.next();
                            value.push(c);
                        } else {
                            break;
                        }
                    }
                    other => value.push(other),
                }
            }
            tokens.push(if c == '`' {
                Token::Word(value)
            } else {
                Token::Quoted(value)
            });
        } else if matches!(c, '(' | ')' | ',' | '=' | ';') {
            chars.next();
            tokens.push(Token::Symbol(c));
        } else if c.is_alphanumeric() || matches!(c, '_' | '@' | '.' | '-' | '/') {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || matches!(c, '_' | '@' | '.' | '-' | '/') {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else {
            return None;
        }
    }

    if tokens.last().is_some_and(|t| t.is_symbol(';')) {
        tokens.pop();
    }
    Some(tokens)
}

/// A statement the server answers itself.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BranchStatement {
    ActiveBranch { alias: Option<String> },
    GetDefault { alias: Option<String> },
    SetDefault(String),
    Checkout(String),
    CreateAndCheckout(String),
}

/// Recognises branch statements.
///
/// `Ok(None)` means the statement belongs to the engine. Only a `checkout(...)`
/// call with a malformed argument list is reported as a syntax error.
fn parse(sql: &str) -> Result<Option<BranchStatement>, StatementError> {
    let Some(tokens) = tokenize(sql) else {
        return Ok(None);
    };

    match tokens.as_slice() {
        [select, func, open, close, rest @ ..]
            if select.is_word("select")
                && func.is_word("active_branch")
                && open.is_symbol('(')
                && close.is_symbol(')') =>
        {
            Ok(parse_alias(rest).map(|alias| BranchStatement::ActiveBranch { alias }))
        }
        [select, variable, rest @ ..]
            if select.is_word("select") && variable.is_word(DEFAULT_BRANCH_VARIABLE) =>
        {
            Ok(parse_alias(rest).map(|alias| BranchStatement::GetDefault { alias }))
        }
        [set, global, variable, eq, value]
            if set.is_word("set")
                && global.is_word("global")
                && variable.is_word("default_branch")
                && eq.is_symbol('=') =>
        {
            string_value(value).map(|v| Some(BranchStatement::SetDefault(v)))
        }
        [set, variable, eq, value]
            if set.is_word("set") && variable.is_word(DEFAULT_BRANCH_VARIABLE) && eq.is_symbol('=') =>
        {
            string_value(value).map(|v| Some(BranchStatement::SetDefault(v)))
        }
        [verb, func, open, rest @ ..]
            if (verb.is_word("select") || verb.is_word("call"))
                && func.is_word("checkout")
                && open.is_symbol('(') =>
        {
            // The call must be the whole statement.
            match rest.iter().position(|t| t.is_symbol(')')) {
                Some(close) if close + 1 == rest.len() => {
                    parse_checkout_args(&rest[..close]).map(Some)
                }
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// `None` when the tail is not an alias clause.
fn parse_alias(rest: &[Token]) -> Option<Option<String>> {
    match rest {
        [] => Some(None),
        [as_kw, Token::Word(alias) | Token::Quoted(alias)] if as_kw.is_word("as") => {
            Some(Some(alias.clone()))
        }
        [Token::Word(alias)] if !is_reserved(alias) => Some(Some(alias.clone())),
        _ => None,
    }
}

fn is_reserved(word: &str) -> bool {
    ["as", "from", "where", "limit", "union"]
        .iter()
        .any(|kw| word.eq_ignore_ascii_case(kw))
}

fn string_value(token: &Token) -> Result<String, StatementError> {
    match token {
        Token::Quoted(value) | Token::Word(value) => Ok(value.clone()),
        Token::Symbol(c) => Err(StatementError::Syntax(format!(
            "expected a branch name, found '{c}'"
        ))),
    }
}

fn parse_checkout_args(args: &[Token]) -> Result<BranchStatement, StatementError> {
    let values = args
        .split(|t| t.is_symbol(','))
        .map(|arg| match arg {
            [Token::Quoted(value)] => Ok(value.clone()),
            _ => Err(StatementError::Syntax(
                "checkout arguments must be quoted strings".into(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    match values.as_slice() {
        [target] => Ok(BranchStatement::Checkout(target.clone())),
        [flag, name] if flag == "-b" => Ok(BranchStatement::CreateAndCheckout(name.clone())),
        [flag, _] => Err(StatementError::Syntax(format!(
            "unsupported checkout option '{flag}'"
        ))),
        _ => Err(StatementError::Syntax(format!(
            "checkout takes 1 or 2 arguments, got {}",
            values.len()
        ))),
    }
}

/// Routes statements for every connection of one server run.
///
/// Shared by all connection tasks; holds no per-connection state.
pub struct Dispatcher {
    engine: Arc<dyn QueryEngine>,
    store: Arc<dyn BranchStore>,
    default_branch: Arc<DefaultBranch>,
    read_only: bool,
    statement_limit: Option<Duration>,
}

impl Dispatcher {
    /// Creates a dispatcher.
    pub fn new(
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn BranchStore>,
        default_branch: Arc<DefaultBranch>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            default_branch,
            read_only: config.read_only(),
            statement_limit: config.statement_limit(),
        }
    }

    /// Returns the server-wide default branch.
    pub fn default_branch(&self) -> &Arc<DefaultBranch> {
        &self.default_branch
    }

    /// Executes one statement on behalf of `session`.
    pub async fn execute(
        &self,
        session: &mut Session,
        sql: &str,
    ) -> Result<QueryResult, StatementError> {
        match parse(sql)? {
            Some(statement) => self.execute_branch_statement(session, statement),
            None => self.execute_query(session, sql).await,
        }
    }

    fn execute_branch_statement(
        &self,
        session: &mut Session,
        statement: BranchStatement,
    ) -> Result<QueryResult, StatementError> {
        match statement {
            BranchStatement::ActiveBranch { alias } => Ok(QueryResult::single(
                alias.unwrap_or_else(|| ACTIVE_BRANCH_COLUMN.to_string()),
                session.active_branch().as_str(),
            )),
            BranchStatement::GetDefault { alias } => Ok(QueryResult::single(
                alias.unwrap_or_else(|| DEFAULT_BRANCH_VARIABLE.to_string()),
                self.default_branch.get().as_str(),
            )),
            BranchStatement::SetDefault(name) => {
                let branch = BranchRef::new(name)?;
                let previous = self.default_branch.set(branch.clone());
                info!(
                    connection_id = session.id(),
                    from = %previous,
                    to = %branch,
                    "default branch changed"
                );
                Ok(QueryResult::empty())
            }
            BranchStatement::Checkout(name) => {
                let target = BranchRef::new(name)?;
                if !self.store.contains(&target) {
                    return Err(StatementError::BranchNotFound(target.to_string()));
                }
                let previous = session.checkout(target);
                debug!(
                    connection_id = session.id(),
                    from = %previous,
                    to = %session.active_branch(),
                    "checked out branch"
                );
                Ok(QueryResult::single(STATUS_COLUMN, "0"))
            }
            BranchStatement::CreateAndCheckout(name) => {
                if self.read_only {
                    return Err(StatementError::ReadOnly);
                }
                let branch = BranchRef::new(name)?;
                self.store.create_branch(&branch, session.active_branch())?;
                let previous = session.checkout(branch);
                debug!(
                    connection_id = session.id(),
                    from = %previous,
                    to = %session.active_branch(),
                    "created and checked out branch"
                );
                Ok(QueryResult::single(STATUS_COLUMN, "0"))
            }
        }
    }

    async fn execute_query(
        &self,
        session: &Session,
        sql: &str,
    ) -> Result<QueryResult, StatementError> {
        let ctx = StatementContext {
            connection_id: session.id(),
            user: session.user().to_string(),
            branch: session.active_branch().clone(),
            read_only: self.read_only,
        };
        let engine = Arc::clone(&self.engine);
        let statement = sql.to_string();
        let task = tokio::task::spawn_blocking(move || engine.execute(&ctx, &statement));

        let joined = match self.statement_limit {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        connection_id = session.id(),
                        timeout_ms = limit.as_millis() as u64,
                        "statement timed out"
                    );
                    return Err(StatementError::Timeout(limit));
                }
            },
            None => task.await,
        };

        joined.map_err(|e| StatementError::Engine(format!("statement task failed: {e}")))?
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("default_branch", &self.default_branch)
            .field("read_only", &self.read_only)
            .field("statement_limit", &self.statement_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryBranchStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        seen: Mutex<Vec<(StatementContext, String)>>,
        delay: Option<Duration>,
    }

    impl QueryEngine for RecordingEngine {
        fn execute(
            &self,
            ctx: &StatementContext,
            sql: &str,
        ) -> Result<QueryResult, StatementError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.seen.lock().push((ctx.clone(), sql.to_string()));
            Ok(QueryResult::single("branch", ctx.branch.as_str()))
        }
    }

    fn branch(name: &str) -> BranchRef {
        BranchRef::new(name).unwrap()
    }

    struct Fixture {
        engine: Arc<RecordingEngine>,
        store: Arc<MemoryBranchStore>,
        dispatcher: Dispatcher,
    }

    fn fixture(config: ServerConfig, engine: RecordingEngine) -> Fixture {
        let engine = Arc::new(engine);
        let store = Arc::new(MemoryBranchStore::default());
        let default_branch = Arc::new(DefaultBranch::new(branch("main")));
        let dispatcher = Dispatcher::new(
            engine.clone(),
            store.clone(),
            default_branch,
            &config,
        );
        Fixture {
            engine,
            store,
            dispatcher,
        }
    }

    fn session(fixture: &Fixture, id: u32) -> Session {
        Session::open(id, "root", fixture.dispatcher.default_branch())
    }

    #[test]
    fn tokenizer_handles_quotes_and_trailing_semicolon() {
        let tokens = tokenize("CALL checkout('it''s', \"x\");").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Word("CALL".into()),
                Token::Word("checkout".into()),
                Token::Symbol('('),
                Token::Quoted("it's".into()),
                Token::Symbol(','),
                Token::Quoted("x".into()),
                Token::Symbol(')'),
            ]
        );
        assert_eq!(tokenize("SELECT 'open"), None);
    }

    #[test]
    fn branch_statements_are_recognised() {
        let cases = [
            (
                "select ACTIVE_BRANCH()",
                BranchStatement::ActiveBranch { alias: None },
            ),
            (
                "SELECT active_branch() AS b;",
                BranchStatement::ActiveBranch {
                    alias: Some("b".into()),
                },
            ),
            (
                "SELECT @@GLOBAL.default_branch",
                BranchStatement::GetDefault { alias: None },
            ),
            (
                "SET GLOBAL default_branch = 'refs/heads/new'",
                BranchStatement::SetDefault("refs/heads/new".into()),
            ),
            (
                "set @@global.default_branch='new'",
                BranchStatement::SetDefault("new".into()),
            ),
            (
                "SELECT checkout('new')",
                BranchStatement::Checkout("new".into()),
            ),
            (
                "call checkout('-b', 'feature/x')",
                BranchStatement::CreateAndCheckout("feature/x".into()),
            ),
        ];
        for (sql, expected) in cases {
            assert_eq!(parse(sql).unwrap(), Some(expected), "{sql}");
        }
    }

    #[test]
    fn other_statements_go_to_the_engine() {
        for sql in [
            "SELECT 1",
            "SELECT * FROM t WHERE name = 'checkout'",
            "INSERT INTO t VALUES (1)",
            "SELECT active_branch",
            "SELECT 'unterminated",
            "SELECT checkout FROM audit",
            "SELECT checkout('main') FROM dual",
            "SELECT active_branch() FROM t",
            "SELECT @@global.default_branch FROM dual",
            "CALL checkout 'new'",
            "SELECT checkout('a'",
        ] {
            assert_eq!(parse(sql).unwrap(), None, "{sql}");
        }
    }

    #[test]
    fn malformed_checkout_is_a_syntax_error() {
        for sql in [
            "SELECT checkout()",
            "SELECT checkout(new)",
            "SELECT checkout('-x', 'new')",
            "SELECT checkout('a', 'b', 'c')",
        ] {
            assert!(
                matches!(parse(sql), Err(StatementError::Syntax(_))),
                "{sql}"
            );
        }
    }

    #[tokio::test]
    async fn active_branch_reports_session_branch() {
        let fixture = fixture(ServerConfig::default(), RecordingEngine::default());
        let mut session = session(&fixture, 1);

        let result = fixture
            .dispatcher
            .execute(&mut session, "SELECT active_branch()")
            .await
            .unwrap();
        assert_eq!(result, QueryResult::single("active_branch()", "main"));
    }

    #[tokio::test]
    async fn checkout_requires_existing_branch() {
        let fixture = fixture(ServerConfig::default(), RecordingEngine::default());
        let mut session = session(&fixture, 1);

        let err = fixture
            .dispatcher
            .execute(&mut session, "SELECT checkout('missing')")
            .await
            .unwrap_err();
        assert_eq!(err, StatementError::BranchNotFound("missing".into()));
        assert_eq!(session.active_branch(), &branch("main"));

        fixture
            .store
            .create_branch(&branch("dev"), &branch("main"))
            .unwrap();
        let result = fixture
            .dispatcher
            .execute(&mut session, "CALL checkout('dev')")
            .await
            .unwrap();
        assert_eq!(result, QueryResult::single("status", "0"));
        assert_eq!(session.active_branch(), &branch("dev"));
    }

    #[tokio::test]
    async fn create_and_checkout() {
        let fixture = fixture(ServerConfig::default(), RecordingEngine::default());
        let mut session = session(&fixture, 1);

        fixture
            .dispatcher
            .execute(&mut session, "SELECT checkout('-b', 'new')")
            .await
            .unwrap();
        assert_eq!(session.active_branch(), &branch("new"));
        assert!(fixture.store.contains(&branch("new")));

        let err = fixture
            .dispatcher
            .execute(&mut session, "SELECT checkout('-b', 'new')")
            .await
            .unwrap_err();
        assert_eq!(err, StatementError::BranchExists("new".into()));
    }

    #[tokio::test]
    async fn read_only_rejects_branch_creation() {
        let fixture = fixture(
            ServerConfig::default().with_read_only(true),
            RecordingEngine::default(),
        );
        let mut session = session(&fixture, 1);

        let err = fixture
            .dispatcher
            .execute(&mut session, "CALL checkout('-b', 'new')")
            .await
            .unwrap_err();
        assert_eq!(err, StatementError::ReadOnly);
        assert!(!fixture.store.contains(&branch("new")));
    }

    #[tokio::test]
    async fn default_change_affects_only_new_sessions() {
        let fixture = fixture(ServerConfig::default(), RecordingEngine::default());
        let mut before = session(&fixture, 1);

        fixture
            .dispatcher
            .execute(&mut before, "SET GLOBAL default_branch = 'refs/heads/new'")
            .await
            .unwrap();
        let mut after = session(&fixture, 2);

        let global = fixture
            .dispatcher
            .execute(&mut before, "SELECT @@global.default_branch")
            .await
            .unwrap();
        assert_eq!(global.rows, vec![vec!["new".to_string()]]);
        assert_eq!(before.active_branch(), &branch("main"));
        assert_eq!(after.active_branch(), &branch("new"));

        let err = fixture
            .dispatcher
            .execute(&mut after, "SET GLOBAL default_branch = 'a..b'")
            .await
            .unwrap_err();
        assert!(matches!(err, StatementError::InvalidBranch(_)));
    }

    #[tokio::test]
    async fn engine_sees_active_branch() {
        let fixture = fixture(
            ServerConfig::default().with_read_only(true),
            RecordingEngine::default(),
        );
        let mut session = session(&fixture, 7);
        fixture
            .store
            .create_branch(&branch("dev"), &branch("main"))
            .unwrap();

        fixture
            .dispatcher
            .execute(&mut session, "SELECT 1")
            .await
            .unwrap();
        fixture
            .dispatcher
            .execute(&mut session, "SELECT checkout('dev')")
            .await
            .unwrap();
        fixture
            .dispatcher
            .execute(&mut session, "SELECT 2")
            .await
            .unwrap();

        let seen = fixture.engine.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0.branch, branch("main"));
        assert_eq!(seen[0].1, "SELECT 1");
        assert_eq!(seen[1].0.branch, branch("dev"));
        assert_eq!(seen[1].0.connection_id, 7);
        assert!(seen[1].0.read_only);
    }

    #[tokio::test]
    async fn lookalike_statements_reach_the_engine() {
        let fixture = fixture(ServerConfig::default(), RecordingEngine::default());
        let mut session = session(&fixture, 1);
        let statements = [
            "SELECT checkout FROM audit",
            "SELECT checkout('main') FROM dual",
            "SELECT active_branch() FROM t",
        ];

        for sql in statements {
            let result = fixture.dispatcher.execute(&mut session, sql).await.unwrap();
            assert_eq!(result, QueryResult::single("branch", "main"), "{sql}");
        }

        let seen = fixture.engine.seen.lock();
        let forwarded: Vec<_> = seen.iter().map(|(_, sql)| sql.as_str()).collect();
        assert_eq!(forwarded, statements);
    }

    #[tokio::test]
    async fn slow_statement_times_out() {
        let fixture = fixture(
            ServerConfig::default().with_read_timeout(Duration::from_millis(20)),
            RecordingEngine {
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        );
        let mut session = session(&fixture, 1);

        let err = fixture
            .dispatcher
            .execute(&mut session, "SELECT sleep(1)")
            .await
            .unwrap_err();
        assert_eq!(err, StatementError::Timeout(Duration::from_millis(20)));
    }
}
