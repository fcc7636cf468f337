//! Request-derived template functions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Middleware, Next, Skipper, default_skipper};
use crate::context::{Context, TemplateFn, TemplateFuncs};
use crate::error::Result;
use crate::session::{FLASH_KEY, cookie};

/// Registers template functions that read the current request, plus any
/// caller-supplied ones, before the downstream chain runs.
///
/// | Function           | Returns                                           |
/// |--------------------|---------------------------------------------------|
/// | `Query(key)`       | first query parameter `key`                       |
/// | `QueryValues(key)` | every query parameter `key`, as an array          |
/// | `Form(key)`        | first urlencoded form field `key`                 |
/// | `FormValues(key)`  | every form field `key`, as an array               |
/// | `Param(name)`      | route parameter `name`                            |
/// | `Header(name)`     | first request header `name`                       |
/// | `Cookie(name)`     | request cookie `name`                             |
/// | `Path()`           | decoded request path                              |
/// | `URL()`            | raw path plus query string                        |
/// | `Stored(key)`      | context store entry `key`; the whole store bare   |
/// | `Session(key)`     | session value `key`                               |
/// | `Flash(key)`       | pending flash messages under `key` (or default)   |
///
/// Every function reads the context when the template calls it. String
/// lookups that find nothing return an empty string, the others `null`.
///
/// When a session middleware sits outside this one, the session is loaded
/// before the chain continues so `Session` and `Flash` see its values. Turn
/// that off with [`preload_session`](Self::preload_session). `Flash` only
/// peeks; handlers consume messages through
/// [`SessionHandle::flashes`](crate::session::SessionHandle::flashes).
pub struct FuncMap {
    extra: TemplateFuncs,
    preload_session: bool,
    skipper: Skipper,
}

impl Default for FuncMap {
    fn default() -> Self {
        Self {
            extra: TemplateFuncs::new(),
            preload_session: true,
            skipper: default_skipper(),
        }
    }
}

impl FuncMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function registered on every request alongside the built-ins.
    /// A built-in of the same name is replaced.
    #[must_use]
    pub fn func<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let f: TemplateFn = Arc::new(move |_: &Context, args: &[Value]| f(args));
        self.extra.insert(name.into(), f);
        self
    }

    /// Whether to load the session up front. Defaults to `true`.
    #[must_use]
    pub fn preload_session(mut self, preload: bool) -> Self {
        self.preload_session = preload;
        self
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }
}

fn first_arg(args: &[Value]) -> Option<&str> {
    args.first().and_then(Value::as_str)
}

fn text<F>(read: F) -> TemplateFn
where
    F: Fn(&Context, &str) -> String + Send + Sync + 'static,
{
    Arc::new(move |ctx: &Context, args: &[Value]| {
        Value::String(read(ctx, first_arg(args).unwrap_or_default()))
    })
}

fn values_of(pairs: Vec<(String, String)>, key: &str) -> Value {
    pairs
        .into_iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| Value::String(v))
        .collect()
}

fn query_pairs(ctx: &Context) -> Vec<(String, String)> {
    serde_urlencoded::from_str(ctx.request().query_string()).unwrap_or_default()
}

fn form_pairs(ctx: &Context) -> Vec<(String, String)> {
    let is_form = ctx
        .header("content-type")
        .to_ascii_lowercase()
        .starts_with("application/x-www-form-urlencoded");
    if !is_form {
        return Vec::new();
    }
    serde_urlencoded::from_bytes(ctx.body()).unwrap_or_default()
}

fn stored(ctx: &Context, args: &[Value]) -> Value {
    match first_arg(args) {
        Some(key) => ctx
            .get(key)
            .and_then(|v| v.to_json().ok())
            .unwrap_or(Value::Null),
        None => ctx
            .stored()
            .filter_map(|(k, v)| Some((k.to_owned(), v.to_json().ok()?)))
            .collect::<Map<String, Value>>()
            .into(),
    }
}

fn session_value(ctx: &Context, key: &str) -> Value {
    ctx.session_values()
        .and_then(|values| values.get(key))
        .cloned()
        .unwrap_or(Value::Null)
}

fn builtins() -> TemplateFuncs {
    let mut funcs = TemplateFuncs::new();
    funcs.insert("Query".into(), text(|ctx, key| ctx.query(key).to_owned()));
    funcs.insert("Form".into(), text(|ctx, key| ctx.form(key).to_owned()));
    funcs.insert("Param".into(), text(|ctx, name| ctx.param(name).to_owned()));
    funcs.insert("Header".into(), text(|ctx, name| ctx.header(name).to_owned()));
    funcs.insert(
        "Cookie".into(),
        text(|ctx, name| {
            cookie::find(ctx.request().headers(), name)
                .unwrap_or_default()
                .to_owned()
        }),
    );
    funcs.insert("Path".into(), text(|ctx, _| ctx.path().to_owned()));
    funcs.insert("URL".into(), text(|ctx, _| ctx.uri()));
    funcs.insert(
        "QueryValues".into(),
        Arc::new(|ctx: &Context, args: &[Value]| {
            values_of(query_pairs(ctx), first_arg(args).unwrap_or_default())
        }),
    );
    funcs.insert(
        "FormValues".into(),
        Arc::new(|ctx: &Context, args: &[Value]| {
            values_of(form_pairs(ctx), first_arg(args).unwrap_or_default())
        }),
    );
    funcs.insert("Stored".into(), Arc::new(stored));
    funcs.insert(
        "Session".into(),
        Arc::new(|ctx: &Context, args: &[Value]| {
            session_value(ctx, first_arg(args).unwrap_or_default())
        }),
    );
    funcs.insert(
        "Flash".into(),
        Arc::new(|ctx: &Context, args: &[Value]| {
            session_value(ctx, first_arg(args).unwrap_or(FLASH_KEY))
        }),
    );
    funcs
}

#[async_trait]
impl Middleware for FuncMap {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.skipper)(ctx) {
            return next.run(ctx).await;
        }

        if self.preload_session {
            if let Ok(mut session) = ctx.session() {
                session.load().await;
            }
        }
        for (name, f) in builtins().into_iter().chain(self.extra.clone()) {
            ctx.set_func_arc(name, f);
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Params;
    use crate::engine::{BufferedResponse, Request, Response};
    use crate::http;
    use crate::middleware::tests::context_with;
    use crate::middleware::{chain, from_middleware, handler_fn};
    use crate::session::{SessionError, SessionOptions, SessionRecord, Sessions, Store};
    use serde_json::json;
    use std::sync::Mutex;

    // Runs `funcs` and then evaluates each `(name, args)` call in the handler.
    async fn call_all(
        funcs: FuncMap,
        outer: Vec<crate::middleware::BoxMiddleware>,
        mut ctx: Context,
        calls: Vec<(&'static str, Vec<Value>)>,
    ) -> Vec<Value> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = Arc::clone(&seen);
        let handler = handler_fn(move |ctx| {
            let out = Arc::clone(&out);
            let calls = calls.clone();
            Box::pin(async move {
                ctx.set("user", json!({"id": 7}));
                let got: Vec<Value> = calls
                    .iter()
                    .map(|(name, args)| ctx.call_func(name, args).unwrap_or(json!("<missing>")))
                    .collect();
                out.lock().unwrap().extend(got);
                Ok(())
            })
        });
        let mut middleware = outer;
        middleware.push(from_middleware(funcs));
        chain(&middleware, handler).call(&mut ctx).await.unwrap();
        let got = seen.lock().unwrap().clone();
        got
    }

    #[tokio::test]
    async fn request_functions_are_registered() {
        let funcs = FuncMap::new().func("Upper", |args| {
            json!(args[0].as_str().unwrap_or_default().to_uppercase())
        });
        let mut ctx = context_with(
            "GET",
            "/users/7?page=3&tag=a&tag=b",
            "X-Token: t1\r\nCookie: theme=dark; lang=en\r\n",
        );
        ctx.set_params([("id".to_owned(), "7".to_owned())].into_iter().collect::<Params>());

        let got = call_all(
            funcs,
            Vec::new(),
            ctx,
            vec![
                ("Query", vec![json!("page")]),
                ("QueryValues", vec![json!("tag")]),
                ("Header", vec![json!("x-token")]),
                ("Param", vec![json!("id")]),
                ("Cookie", vec![json!("lang")]),
                ("Cookie", vec![json!("missing")]),
                ("Path", vec![]),
                ("URL", vec![]),
                ("Form", vec![json!("missing")]),
                ("FormValues", vec![json!("missing")]),
                ("Upper", vec![json!("abc")]),
            ],
        )
        .await;

        assert_eq!(
            got,
            vec![
                json!("3"),
                json!(["a", "b"]),
                json!("t1"),
                json!("7"),
                json!("en"),
                json!(""),
                json!("/users/7"),
                json!("/users/7?page=3&tag=a&tag=b"),
                json!(""),
                json!([]),
                json!("ABC"),
            ]
        );
    }

    #[tokio::test]
    async fn form_values_come_from_the_body() {
        let raw = "POST /save HTTP/1.1\r\nHost: h\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 19\r\n\r\nitem=x&item=y&n=%31";
        let (req, _) = http::Request::parse(raw.as_bytes()).unwrap();
        let ctx = Context::new(Box::new(req), Box::new(BufferedResponse::new()));

        let got = call_all(
            FuncMap::new(),
            Vec::new(),
            ctx,
            vec![("FormValues", vec![json!("item")]), ("Form", vec![json!("n")])],
        )
        .await;
        assert_eq!(got, vec![json!(["x", "y"]), json!("1")]);
    }

    #[tokio::test]
    async fn stored_reads_values_set_after_registration() {
        let got = call_all(
            FuncMap::new(),
            Vec::new(),
            context_with("GET", "/", ""),
            vec![
                ("Stored", vec![json!("user")]),
                ("Stored", vec![json!("nope")]),
                ("Stored", vec![]),
            ],
        )
        .await;
        assert_eq!(
            got,
            vec![json!({"id": 7}), Value::Null, json!({"user": {"id": 7}})]
        );
    }

    struct KnownVisitor;

    #[async_trait]
    impl Store for KnownVisitor {
        async fn get(&self, _req: &dyn Request, name: &str) -> std::result::Result<SessionRecord, SessionError> {
            let mut record = SessionRecord::new(name, SessionOptions::default());
            record.values.insert("user".into(), json!("ann"));
            record.values.insert(FLASH_KEY.into(), json!(["saved"]));
            record.values.insert("errors".into(), json!(["bad input"]));
            record.is_new = false;
            Ok(record)
        }

        async fn save(
            &self,
            _req: &dyn Request,
            _res: &mut dyn Response,
            _record: &mut SessionRecord,
        ) -> std::result::Result<(), SessionError> {
            Ok(())
        }

        fn configure(&self, _options: &SessionOptions) {}
    }

    fn sessions() -> crate::middleware::BoxMiddleware {
        from_middleware(Sessions::new(SessionOptions::default(), Arc::new(KnownVisitor)))
    }

    #[tokio::test]
    async fn session_and_flash_read_the_preloaded_session() {
        let got = call_all(
            FuncMap::new(),
            vec![sessions()],
            context_with("GET", "/", ""),
            vec![
                ("Session", vec![json!("user")]),
                ("Session", vec![json!("nope")]),
                ("Flash", vec![]),
                ("Flash", vec![json!("errors")]),
            ],
        )
        .await;
        assert_eq!(
            got,
            vec![json!("ann"), Value::Null, json!(["saved"]), json!(["bad input"])]
        );
    }

    #[tokio::test]
    async fn session_stays_unloaded_without_preload() {
        let got = call_all(
            FuncMap::new().preload_session(false),
            vec![sessions()],
            context_with("GET", "/", ""),
            vec![("Session", vec![json!("user")])],
        )
        .await;
        assert_eq!(got, vec![Value::Null]);
    }

    #[tokio::test]
    async fn skipped_requests_get_no_functions() {
        let funcs = FuncMap::new().skipper(Arc::new(|_: &Context| true));
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                assert!(ctx.funcs().is_empty());
                Ok(())
            })
        });
        let mut ctx = context_with("GET", "/", "");
        chain(&[from_middleware(funcs)], handler)
            .call(&mut ctx)
            .await
            .unwrap();
    }
}
