//! Test attributes that fail a test when it runs past a wall-clock deadline.
//!
//! ```ignore
//! #[test_timeout::timeout(5)]
//! fn sync_case() {}
//!
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn single_threaded_case() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread", worker_threads = 4)]
//! async fn racing_case() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct TimeoutArgs {
    secs: u64,
    flavor: Flavor,
    worker_threads: Option<usize>,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            worker_threads: None,
        }
    }
}

impl TimeoutArgs {
    /// Accepts either a bare integer (`5`) or `key = value` pairs.
    fn parse(attr: TokenStream, allow_runtime: bool) -> syn::Result<Self> {
        let mut args = Self::default();
        if attr.is_empty() {
            return Ok(args);
        }
        if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
            args.secs = parse_secs(&lit)?;
            return Ok(args);
        }

        let parser = syn::meta::parser(|meta| args.apply(meta, allow_runtime));
        syn::parse::Parser::parse(parser, attr)?;

        if args.worker_threads.is_some() && args.flavor != Flavor::MultiThread {
            return Err(syn::Error::new(
                proc_macro2::Span::call_site(),
                "worker_threads requires flavor = \"multi_thread\"",
            ));
        }
        Ok(args)
    }

    fn apply(&mut self, meta: ParseNestedMeta<'_>, allow_runtime: bool) -> syn::Result<()> {
        if meta.path.is_ident("secs") {
            self.secs = parse_secs(&meta.value()?.parse()?)?;
            return Ok(());
        }
        if allow_runtime && meta.path.is_ident("flavor") {
            let lit: LitStr = meta.value()?.parse()?;
            self.flavor = match lit.value().as_str() {
                "current_thread" => Flavor::CurrentThread,
                "multi_thread" => Flavor::MultiThread,
                other => {
                    return Err(syn::Error::new_spanned(
                        &lit,
                        format!("unknown runtime flavor `{other}`"),
                    ))
                }
            };
            return Ok(());
        }
        if allow_runtime && meta.path.is_ident("worker_threads") {
            let lit: LitInt = meta.value()?.parse()?;
            let threads: usize = lit.base10_parse()?;
            if threads == 0 {
                return Err(syn::Error::new_spanned(&lit, "worker_threads must be at least 1"));
            }
            self.worker_threads = Some(threads);
            return Ok(());
        }
        Err(meta.error("unsupported test_timeout argument"))
    }

    fn runtime_builder(&self) -> TokenStream2 {
        match (self.flavor, self.worker_threads) {
            (Flavor::CurrentThread, _) => quote! {
                tokio::runtime::Builder::new_current_thread()
            },
            (Flavor::MultiThread, Some(threads)) => quote! {
                {
                    let mut builder = tokio::runtime::Builder::new_multi_thread();
                    builder.worker_threads(#threads);
                    builder
                }
            },
            (Flavor::MultiThread, None) => quote! {
                tokio::runtime::Builder::new_multi_thread()
            },
        }
    }
}

fn parse_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Runs `body` on a watchdog thread and panics in the test thread if no
/// result arrives within `secs`.
fn with_deadline(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s deadline", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr, true) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]) && !is_path(attr, &["test"]))
        .collect();
    let builder = args.runtime_builder();
    let secs = args.secs;
    let body = with_deadline(
        secs,
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async {
                tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                    .await
                    .expect("test timed out");
            });
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match TimeoutArgs::parse(attr, false) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let body = with_deadline(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments = &attr.path().segments;
    segments.len() == expected.len()
        && segments
            .iter()
            .zip(expected)
            .all(|(segment, name)| segment.ident == name)
}
