/// Deferred resource values
///
/// An `Output<T>` is a value that may not be known while the stack is being
/// declared. It carries two views of the same value:
///
/// - a symbolic [`Expr`] that the engine bridge renders into the program
///   (`${serviceAccount.email}`), and which records which resources the
///   value derives from
/// - a runtime cell that is resolved exactly once, after the engine has
///   applied the stack
use futures::future::{self, BoxFuture, FutureExt, TryFutureExt};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Errors raised while building or resolving outputs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutputError {
    #[error("output {0} is already resolved")]
    AlreadyResolved(String),

    #[error("output {0} was abandoned before it resolved")]
    Abandoned(String),

    #[error("template {template:?} has {placeholders} placeholders but {args} arguments were given")]
    TemplateArity {
        template: String,
        placeholders: usize,
        args: usize,
    },

    #[error("unbalanced brace in template {0:?}")]
    MalformedTemplate(String),
}

/// Symbolic form of an output value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Known at declaration time
    Literal { value: serde_json::Value },

    /// A property the engine assigns when it creates the resource
    Property { resource: String, property: String },

    /// String built from literal text and other outputs
    Interpolate { parts: Vec<Part> },

    /// Derived through an arbitrary function; only its inputs are known
    Apply { inputs: Vec<Expr> },
}

/// One segment of an interpolated string
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "part", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Value { expr: Expr },
}

impl Expr {
    /// Logical names of every resource this expression reads from
    pub fn resources(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_resources(&mut names);
        names
    }

    fn collect_resources(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Property { resource, .. } => {
                names.insert(resource.clone());
            }
            Expr::Interpolate { parts } => {
                for part in parts {
                    if let Part::Value { expr } = part {
                        expr.collect_resources(names);
                    }
                }
            }
            Expr::Apply { inputs } => {
                for input in inputs {
                    input.collect_resources(names);
                }
            }
        }
    }
}

type PeekFn<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;
type WaitFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, OutputError>> + Send + Sync>;

/// A value that is either known now or resolved later by the engine
pub struct Output<T> {
    expr: Expr,
    peek: PeekFn<T>,
    wait: WaitFn<T>,
}

/// Write side of a deferred output
pub struct Resolver<T> {
    tx: watch::Sender<Option<T>>,
    label: String,
}

impl<T> Resolver<T> {
    /// Resolve the output; a second resolution is rejected
    pub fn resolve(&self, value: T) -> Result<(), OutputError> {
        let mut value = Some(value);
        let accepted = self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        });

        if accepted {
            Ok(())
        } else {
            Err(OutputError::AlreadyResolved(self.label.clone()))
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<T> Output<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A literal value, known at declaration time
    pub fn known(value: T) -> Self
    where
        T: Serialize,
    {
        let expr = Expr::Literal {
            value: serde_json::to_value(&value).unwrap_or(serde_json::Value::Null),
        };
        let peek_value = value.clone();

        Self {
            expr,
            peek: Arc::new(move || Some(peek_value.clone())),
            wait: Arc::new(move || future::ready(Ok(value.clone())).boxed()),
        }
    }

    /// A resource property assigned by the engine, with the resolver that sets it
    pub fn deferred(resource: &str, property: &str) -> (Self, Resolver<T>) {
        let (tx, rx) = watch::channel(None);
        let label = format!("{}.{}", resource, property);

        let peek_rx = rx.clone();
        let wait_label = label.clone();

        let output = Self {
            expr: Expr::Property {
                resource: resource.to_string(),
                property: property.to_string(),
            },
            peek: Arc::new(move || (*peek_rx.borrow()).clone()),
            wait: Arc::new(move || {
                let mut rx = rx.clone();
                let label = wait_label.clone();
                async move {
                    let value: Option<T> = {
                        let slot = rx
                            .wait_for(Option::is_some)
                            .await
                            .map_err(|_| OutputError::Abandoned(label.clone()))?;
                        (*slot).clone()
                    };
                    value.ok_or(OutputError::Abandoned(label))
                }
                .boxed()
            }),
        };

        (output, Resolver { tx, label })
    }

    /// Current value, or `None` while it is still unknown
    pub fn peek(&self) -> Option<T> {
        (*self.peek)()
    }

    /// Wait until the value is resolved
    pub fn wait(&self) -> BoxFuture<'static, Result<T, OutputError>> {
        (*self.wait)()
    }

    /// Derive a new output; it stays unknown until this one is resolved
    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let peek_source = self.clone();
        let peek_f = f.clone();
        let wait_source = self.clone();

        Output {
            expr: Expr::Apply {
                inputs: vec![self.expr.clone()],
            },
            peek: Arc::new(move || peek_source.peek().map(|value| (*peek_f)(value))),
            wait: Arc::new(move || {
                let f = f.clone();
                wait_source.wait().map_ok(move |value| (*f)(value)).boxed()
            }),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Resources this value derives from
    pub fn depends_on(&self) -> BTreeSet<String> {
        self.expr.resources()
    }
}

impl Output<String> {
    /// Build a string from a `{}` template, like `format!`
    ///
    /// `{{` and `}}` produce literal braces. The result is known once every
    /// argument is known.
    pub fn interpolate(template: &str, args: Vec<Output<String>>) -> Result<Self, OutputError> {
        let segments = parse_template(template)?;
        let placeholders = segments
            .iter()
            .filter(|s| matches!(s, Segment::Slot))
            .count();
        if placeholders != args.len() {
            return Err(OutputError::TemplateArity {
                template: template.to_string(),
                placeholders,
                args: args.len(),
            });
        }

        let mut parts = Vec::with_capacity(segments.len());
        let mut next_arg = args.iter();
        for segment in &segments {
            match segment {
                Segment::Text(text) => parts.push(Part::Text { text: text.clone() }),
                Segment::Slot => {
                    if let Some(arg) = next_arg.next() {
                        parts.push(Part::Value {
                            expr: arg.expr.clone(),
                        });
                    }
                }
            }
        }

        let segments = Arc::new(segments);
        let args = Arc::new(args);
        let peek_segments = segments.clone();
        let peek_args = args.clone();

        Ok(Self {
            expr: Expr::Interpolate { parts },
            peek: Arc::new(move || {
                let values: Option<Vec<String>> = peek_args.iter().map(Output::peek).collect();
                values.map(|values| fill_template(&peek_segments, &values))
            }),
            wait: Arc::new(move || {
                let segments = segments.clone();
                let pending: Vec<_> = args.iter().map(Output::wait).collect();
                future::try_join_all(pending)
                    .map_ok(move |values| fill_template(&segments, &values))
                    .boxed()
            }),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Slot,
}

fn parse_template(template: &str) -> Result<Vec<Segment>, OutputError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, chars.peek().copied()) {
            ('{', Some('{')) => {
                chars.next();
                text.push('{');
            }
            ('{', Some('}')) => {
                chars.next();
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Slot);
            }
            ('}', Some('}')) => {
                chars.next();
                text.push('}');
            }
            ('{', _) | ('}', _) => {
                return Err(OutputError::MalformedTemplate(template.to_string()));
            }
            _ => text.push(c),
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    Ok(segments)
}

fn fill_template(segments: &[Segment], values: &[String]) -> String {
    let mut out = String::new();
    let mut values = values.iter();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Slot => {
                if let Some(value) = values.next() {
                    out.push_str(value);
                }
            }
        }
    }
    out
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            expr: self.expr.clone(),
            peek: self.peek.clone(),
            wait: self.wait.clone(),
        }
    }
}

impl<T> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output").field("expr", &self.expr).finish()
    }
}

/// Outputs compare by what they are derived from, not by their current value
impl<T> PartialEq for Output<T> {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl<T> Serialize for Output<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.expr.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_output() {
        let output = Output::known("goodluck-standard-gke".to_string());
        assert_eq!(output.peek().as_deref(), Some("goodluck-standard-gke"));
        assert!(matches!(output.expr(), Expr::Literal { .. }));
        assert!(output.depends_on().is_empty());
    }

    #[test]
    fn test_deferred_output_resolves_once() {
        let (email, resolver) = Output::<String>::deferred("serviceAccount", "email");
        assert!(email.peek().is_none());
        assert!(!resolver.is_resolved());

        resolver
            .resolve("sa@project.iam.gserviceaccount.com".to_string())
            .unwrap();
        assert_eq!(
            email.peek().as_deref(),
            Some("sa@project.iam.gserviceaccount.com")
        );

        let err = resolver.resolve("other".to_string()).unwrap_err();
        assert_eq!(
            err,
            OutputError::AlreadyResolved("serviceAccount.email".to_string())
        );
        assert_eq!(
            email.peek().as_deref(),
            Some("sa@project.iam.gserviceaccount.com")
        );
    }

    #[test]
    fn test_map_follows_source() {
        let (endpoint, resolver) = Output::<String>::deferred("gkeCluster", "endpoint");
        let url = endpoint.map(|ip| format!("https://{}", ip));

        assert!(url.peek().is_none());
        assert_eq!(url.depends_on(), BTreeSet::from(["gkeCluster".to_string()]));
        assert!(matches!(url.expr(), Expr::Apply { .. }));

        resolver.resolve("34.1.2.3".to_string()).unwrap();
        assert_eq!(url.peek().as_deref(), Some("https://34.1.2.3"));
    }

    #[test]
    fn test_interpolate() {
        let (email, resolver) = Output::<String>::deferred("serviceAccount", "email");
        let member = Output::interpolate("serviceAccount:{}", vec![email]).unwrap();

        assert!(member.peek().is_none());
        assert_eq!(
            member.expr(),
            &Expr::Interpolate {
                parts: vec![
                    Part::Text {
                        text: "serviceAccount:".to_string()
                    },
                    Part::Value {
                        expr: Expr::Property {
                            resource: "serviceAccount".to_string(),
                            property: "email".to_string(),
                        }
                    },
                ]
            }
        );

        resolver.resolve("a@b.c".to_string()).unwrap();
        assert_eq!(member.peek().as_deref(), Some("serviceAccount:a@b.c"));
    }

    #[test]
    fn test_interpolate_escapes_and_arity() {
        let literal = Output::interpolate("preferences: {{}}", vec![]).unwrap();
        assert_eq!(literal.peek().as_deref(), Some("preferences: {}"));

        let err = Output::interpolate("{}-{}", vec![Output::known("a".to_string())]).unwrap_err();
        assert!(matches!(
            err,
            OutputError::TemplateArity {
                placeholders: 2,
                args: 1,
                ..
            }
        ));

        assert!(matches!(
            Output::interpolate("broken {", vec![]),
            Err(OutputError::MalformedTemplate(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_resolution() {
        let (endpoint, resolver) = Output::<String>::deferred("gkeCluster", "endpoint");
        let server = Output::interpolate("https://{}", vec![endpoint]).unwrap();

        let waiter = tokio::spawn(server.wait());
        tokio::task::yield_now().await;
        resolver.resolve("10.0.0.1".to_string()).unwrap();

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value, "https://10.0.0.1");
    }

    #[tokio::test]
    async fn test_abandoned_output() {
        let (endpoint, resolver) = Output::<String>::deferred("gkeCluster", "endpoint");
        drop(resolver);

        let err = endpoint.wait().await.unwrap_err();
        assert_eq!(
            err,
            OutputError::Abandoned("gkeCluster.endpoint".to_string())
        );
    }

    #[test]
    fn test_wait_on_known_value() {
        let output = Output::known(3u32).map(|n| n * 2);
        let value = tokio_test::block_on(output.wait()).unwrap();
        assert_eq!(value, 6);
    }
}
