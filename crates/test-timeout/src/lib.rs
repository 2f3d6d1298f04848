use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ItemFn, Lit, Token, parse_macro_input};

struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

fn parse_options(args: Punctuated<Expr, Token![,]>) -> syn::Result<TestOptions> {
    let mut options = TestOptions {
        timeout_secs: 60,
        paused: false,
    };
    for arg in args {
        match &arg {
            Expr::Lit(expr) => match &expr.lit {
                Lit::Int(lit) => {
                    options.timeout_secs = lit.base10_parse()?;
                    if options.timeout_secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                }
                _ => return Err(syn::Error::new_spanned(&arg, "expected timeout in seconds")),
            },
            Expr::Path(path) if path.path.is_ident("paused") => options.paused = true,
            _ => {
                return Err(syn::Error::new_spanned(
                    &arg,
                    "expected a timeout in seconds or `paused`",
                ));
            }
        }
    }
    Ok(options)
}

/// Runs an async test on its own current-thread runtime and fails it after
/// the given number of wall-clock seconds (60 by default). The test's return
/// value, e.g. an `anyhow::Result`, is handed back to the harness.
///
/// `#[tokio_timeout_test(10, paused)]` starts the runtime with a paused clock;
/// the wall-clock limit still applies.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<Expr, Token![,]>::parse_terminated);
    let options = match parse_options(args) {
        Ok(options) => options,
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

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.timeout_secs;
    // a paused clock auto-advances, so only the wall-clock limit is meaningful
    let (builder, body) = if options.paused {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
            },
            quote! { async move #block .await },
        )
    } else {
        (
            quote! {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
            },
            quote! {
                tokio::time::timeout(timeout_duration, async move #block)
                    .await
                    .expect("test timed out")
            },
        )
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder.expect("failed to build Tokio runtime");
                    runtime.block_on(async {
                        #body
                    })
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(value)) => value,
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
