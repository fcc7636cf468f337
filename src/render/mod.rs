//! Renderers and the content-negotiated output dispatcher.
//!
//! Handlers that do not write a response themselves store their payload in
//! the context under [`Options::data_key`]; [`AutoOutput`] then picks an
//! encoding from [`Context::format`]:
//!
//! | format  | output                                                        |
//! |---------|---------------------------------------------------------------|
//! | `json`  | payload as JSON                                               |
//! | `jsonp` | payload as JSON wrapped in the `?callback=` function          |
//! | `xml`   | payload as XML (see [`xml::encode`])                          |
//! | other   | template `ctx[tmpl_key]` or [`Options::default_tmpl`]         |
//!
//! For templates a [`Data`] envelope is unwrapped: its `Data` field becomes the
//! template data and `Info`, `Zone` and `Code` are exposed as template functions.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, Stored};
use crate::error::Result;
use crate::http::StatusCode;
use crate::middleware::{Middleware, Next, Skipper, default_skipper};

pub mod error;
pub mod sse;
pub mod xml;

pub use error::HttpErrorHandler;
pub use sse::SseRenderer;

/// A template or encoding engine.
pub trait Renderer: Send + Sync + 'static {
    /// Writes template `name` applied to `data` into `out`. Template functions
    /// registered on `ctx` are available to the engine.
    fn render(&self, out: &mut dyn io::Write, name: &str, data: &Value, ctx: &Context) -> Result<()>;

    fn content_type(&self) -> &'static str {
        "text/html; charset=utf-8"
    }
}

/// Renders nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopRenderer;

impl Renderer for NopRenderer {
    fn render(&self, _out: &mut dyn io::Write, _name: &str, _data: &Value, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Labelled payload: the data plus auxiliary fields for the template.
///
/// ```
/// use webx::render::Data;
/// use serde_json::json;
///
/// let data = Data::new(json!({"items": []})).with_info("empty").with_code(1);
/// assert_eq!(
///     serde_json::to_value(&data).unwrap(),
///     json!({"Code": 1, "Info": "empty", "Zone": null, "Data": {"items": []}})
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(rename = "Code")]
    pub code: Value,
    #[serde(rename = "Info")]
    pub info: Value,
    #[serde(rename = "Zone")]
    pub zone: Value,
    #[serde(rename = "Data")]
    pub data: Value,
}

impl Data {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<Value>) -> Self {
        self.code = code.into();
        self
    }

    #[must_use]
    pub fn with_info(mut self, info: impl Into<Value>) -> Self {
        self.info = info.into();
        self
    }

    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<Value>) -> Self {
        self.zone = zone.into();
        self
    }
}

/// Writes the response for a negotiated format.
#[async_trait]
pub trait Output: Send + Sync + 'static {
    async fn output(&self, format: &str, ctx: &mut Context, options: &Options) -> Result<()>;
}

/// The dispatch table described in the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOutput;

#[async_trait]
impl Output for DefaultOutput {
    async fn output(&self, format: &str, ctx: &mut Context, options: &Options) -> Result<()> {
        let code = ctx.code();
        let stored = ctx.get(&options.data_key).cloned();
        match format {
            "json" => {
                let value = payload(stored.as_ref())?;
                ctx.json(code, &value).await
            }
            "jsonp" => {
                let value = payload(stored.as_ref())?;
                let callback = ctx.query(&options.jsonp_callback_name).to_owned();
                ctx.jsonp(code, &callback, &value).await
            }
            "xml" => {
                let value = payload(stored.as_ref())?;
                ctx.xml(code, &value).await
            }
            _ => {
                let tmpl = ctx
                    .get(&options.tmpl_key)
                    .and_then(Stored::as_str)
                    .filter(|name| !name.is_empty())
                    .unwrap_or(options.default_tmpl.as_str())
                    .to_owned();
                let data = match stored {
                    Some(Stored::Data(Data {
                        code,
                        info,
                        zone,
                        data,
                    })) => {
                        ctx.set_func("Info", move |_| info.clone());
                        ctx.set_func("Zone", move |_| zone.clone());
                        ctx.set_func("Code", move |_| code.clone());
                        data
                    }
                    Some(Stored::Value(value)) => value,
                    None => Value::Null,
                };
                ctx.render(&tmpl, &data).await
            }
        }
    }
}

fn payload(stored: Option<&Stored>) -> Result<Value> {
    stored.map_or(Ok(Value::Null), Stored::to_json)
}

/// Output dispatcher settings.
#[derive(Clone)]
pub struct Options {
    pub skipper: Skipper,
    /// Context key holding the payload.
    pub data_key: String,
    /// Context key holding the template name.
    pub tmpl_key: String,
    pub default_tmpl: String,
    /// Template used by [`HttpErrorHandler`] when no per-status template is registered.
    pub default_error_tmpl: String,
    /// Query parameter carrying the JSONP callback.
    pub jsonp_callback_name: String,
    /// Status for errors that carry none.
    pub default_error_http_code: StatusCode,
    pub output: Arc<dyn Output>,
}

impl Default for Options {
    fn default() -> Self {
        Self::from_config(&RenderConfig::default())
    }
}

impl Options {
    pub fn from_config(config: &RenderConfig) -> Self {
        Self {
            skipper: default_skipper(),
            data_key: config.data_key.clone(),
            tmpl_key: config.tmpl_key.clone(),
            default_tmpl: config.default_tmpl.clone(),
            default_error_tmpl: config.default_error_tmpl.clone(),
            jsonp_callback_name: config.jsonp_callback_name.clone(),
            default_error_http_code: StatusCode::from_u16(config.default_error_http_code)
                .unwrap_or(StatusCode::InternalServerError),
            output: Arc::new(DefaultOutput),
        }
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }

    #[must_use]
    pub fn output(mut self, output: Arc<dyn Output>) -> Self {
        self.output = output;
        self
    }
}

/// The serialisable part of [`Options`], plus per-status error templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub data_key: String,
    pub tmpl_key: String,
    pub default_tmpl: String,
    pub default_error_tmpl: String,
    pub jsonp_callback_name: String,
    pub default_error_http_code: u16,
    /// Status code (as a string key, e.g. `"404"`) to template name, used by
    /// [`HttpErrorHandler::from_config`].
    pub error_templates: HashMap<String, String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            data_key: "data".to_owned(),
            tmpl_key: "tmpl".to_owned(),
            default_tmpl: "index".to_owned(),
            default_error_tmpl: String::new(),
            jsonp_callback_name: "callback".to_owned(),
            default_error_http_code: 500,
            error_templates: HashMap::new(),
        }
    }
}

/// Runs the configured [`Output`] for the negotiated format.
pub async fn output(ctx: &mut Context, options: &Options) -> Result<()> {
    let format = ctx.format();
    options.output.output(&format, ctx, options).await
}

/// Writes the response from the context data once the handler succeeds.
///
/// Handler errors pass through untouched for the error handler. A handler
/// that already committed a response is left alone.
pub struct AutoOutput {
    options: Options,
}

impl AutoOutput {
    pub fn new(options: Options) -> Self {
        Self { options }
    }
}

impl Default for AutoOutput {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

#[async_trait]
impl Middleware for AutoOutput {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if (self.options.skipper)(ctx) {
            return next.run(ctx).await;
        }
        next.run(ctx).await?;
        if ctx.committed() {
            return Ok(());
        }
        output(ctx, &self.options).await
    }
}

/// Installs `renderer` on the request.
pub struct WithRenderer {
    renderer: Arc<dyn Renderer>,
    skipper: Skipper,
}

impl WithRenderer {
    pub fn new(renderer: Arc<dyn Renderer>) -> Self {
        Self {
            renderer,
            skipper: default_skipper(),
        }
    }

    #[must_use]
    pub fn skipper(mut self, skipper: Skipper) -> Self {
        self.skipper = skipper;
        self
    }
}

#[async_trait]
impl Middleware for WithRenderer {
    async fn handle(&self, ctx: &mut Context, next: Next) -> Result<()> {
        if !(self.skipper)(ctx) {
            ctx.set_renderer(Arc::clone(&self.renderer));
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::middleware::tests::{body_of, context, context_with};
    use crate::middleware::{chain, from_middleware, handler_fn};
    use serde_json::json;
    use std::sync::Mutex;

    /// Records every render call and writes `name:data` as the body.
    #[derive(Default)]
    pub(crate) struct Recording {
        pub(crate) calls: Mutex<Vec<(String, Value)>>,
        pub(crate) fail: bool,
    }

    impl Renderer for Recording {
        fn render(&self, out: &mut dyn io::Write, name: &str, data: &Value, ctx: &Context) -> Result<()> {
            if self.fail {
                return Err(crate::Error::Render(format!("template {name} not found")));
            }
            self.calls
                .lock()
                .unwrap()
                .push((name.to_owned(), data.clone()));
            write!(out, "{name}:{data}")?;
            if let Some(info) = ctx.call_func("Info", &[]) {
                write!(out, " info={info}")?;
            }
            Ok(())
        }
    }

    fn ctx_with_renderer(target: &str, headers: &str) -> (Context, Arc<Recording>) {
        let renderer = Arc::new(Recording::default());
        let mut ctx = context_with("GET", target, headers);
        ctx.set_renderer(Arc::clone(&renderer) as Arc<dyn Renderer>);
        (ctx, renderer)
    }

    #[tokio::test]
    async fn json_format_writes_the_payload_exactly() {
        let mut ctx = context("GET", "/?format=json");
        ctx.set("data", json!({"Name": "Webx"}));
        output(&mut ctx, &Options::default()).await.unwrap();
        assert_eq!(
            ctx.response().headers().get("content-type"),
            Some("application/json")
        );
        assert_eq!(body_of(ctx).1, r#"{"Name":"Webx"}"#);
    }

    #[tokio::test]
    async fn jsonp_reads_the_configured_callback_parameter() {
        let mut ctx = context("GET", "/?format=jsonp&cb=handle");
        ctx.set("data", json!([1, 2]));
        let mut options = Options::default();
        options.jsonp_callback_name = "cb".into();
        output(&mut ctx, &options).await.unwrap();
        assert_eq!(body_of(ctx).1, "handle([1,2]);");
    }

    #[tokio::test]
    async fn xml_format_uses_the_xml_encoder() {
        let mut ctx = context_with("GET", "/", "Accept: application/xml\r\n");
        ctx.set("data", json!({"name": "webx"}));
        output(&mut ctx, &Options::default()).await.unwrap();
        let body = body_of(ctx).1;
        assert!(body.ends_with("<response><name>webx</name></response>"), "{body}");
    }

    #[tokio::test]
    async fn unknown_format_renders_the_named_template() {
        let (mut ctx, renderer) = ctx_with_renderer("/?format=csv", "");
        ctx.set("tmpl", "users/list");
        ctx.set("data", json!({"n": 1}));
        output(&mut ctx, &Options::default()).await.unwrap();
        assert_eq!(
            *renderer.calls.lock().unwrap(),
            vec![("users/list".to_owned(), json!({"n": 1}))]
        );
    }

    #[tokio::test]
    async fn missing_template_name_falls_back_to_the_default() {
        let (mut ctx, renderer) = ctx_with_renderer("/", "");
        output(&mut ctx, &Options::default()).await.unwrap();
        assert_eq!(renderer.calls.lock().unwrap()[0].0, "index");
    }

    #[tokio::test]
    async fn data_envelope_is_unwrapped_for_templates() {
        let (mut ctx, renderer) = ctx_with_renderer("/", "");
        ctx.set("data", Data::new(json!(["a"])).with_info("listed"));
        output(&mut ctx, &Options::default()).await.unwrap();
        assert_eq!(renderer.calls.lock().unwrap()[0].1, json!(["a"]));
        assert_eq!(ctx.call_func("Info", &[]), Some(json!("listed")));
        assert_eq!(body_of(ctx).1, r#"index:["a"] info="listed""#);
    }

    #[tokio::test]
    async fn data_envelope_is_kept_whole_for_json() {
        let mut ctx = context("GET", "/?format=json");
        ctx.set("data", Data::new(json!(1)).with_code(7));
        output(&mut ctx, &Options::default()).await.unwrap();
        assert_eq!(
            body_of(ctx).1,
            r#"{"Code":7,"Info":null,"Zone":null,"Data":1}"#
        );
    }

    #[tokio::test]
    async fn auto_output_skips_on_handler_error_and_after_commit() {
        let failing = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.set("data", json!(1));
                Err(StatusCode::Forbidden.into())
            })
        });
        let mut ctx = context("GET", "/?format=json");
        let auto = from_middleware(AutoOutput::default());
        assert!(chain(&[Arc::clone(&auto)], failing).call(&mut ctx).await.is_err());
        assert!(!ctx.committed());

        let writes = handler_fn(|ctx| {
            Box::pin(async move { ctx.string(StatusCode::Accepted, "own").await })
        });
        let mut ctx = context("GET", "/?format=json");
        chain(&[auto], writes).call(&mut ctx).await.unwrap();
        assert_eq!(body_of(ctx), (StatusCode::Accepted, "own".to_owned()));
    }

    #[tokio::test]
    async fn auto_output_uses_the_context_code() {
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                ctx.set_code(StatusCode::Created);
                ctx.set_json("data", &json!({"id": 3}))
            })
        });
        let mut ctx = context("POST", "/?format=json");
        chain(&[from_middleware(AutoOutput::default())], handler)
            .call(&mut ctx)
            .await
            .unwrap();
        assert_eq!(body_of(ctx), (StatusCode::Created, r#"{"id":3}"#.to_owned()));
    }

    #[tokio::test]
    async fn with_renderer_installs_the_renderer() {
        let handler = handler_fn(|ctx| {
            Box::pin(async move {
                assert!(ctx.renderer().is_some());
                ctx.render("page", &Value::Null).await
            })
        });
        let mut ctx = context("GET", "/");
        let mw = from_middleware(WithRenderer::new(Arc::new(NopRenderer)));
        chain(&[mw], handler).call(&mut ctx).await.unwrap();
        assert_eq!(body_of(ctx), (StatusCode::Ok, String::new()));
    }

    #[test]
    fn render_config_deserialises_partially() {
        let config: RenderConfig = toml::from_str(
            r#"
            default_tmpl = "home"
            [error_templates]
            404 = "errors/404"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_tmpl, "home");
        assert_eq!(config.data_key, "data");
        assert_eq!(config.error_templates.get("404").map(String::as_str), Some("errors/404"));
    }
}
