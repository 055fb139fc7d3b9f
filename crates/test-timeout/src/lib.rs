use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// `#[tokio_timeout_test]`, `#[tokio_timeout_test(30)]`,
/// `#[tokio_timeout_test(paused)]` or `#[tokio_timeout_test(paused, 30)]`.
struct TestOptions {
    timeout_secs: u64,
    paused: bool,
}

enum TestOption {
    Timeout(LitInt),
    Paused,
}

impl Parse for TestOption {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TestOption::Timeout(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TestOption::Paused)
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

impl Parse for TestOptions {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = TestOptions {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let items = Punctuated::<TestOption, Token![,]>::parse_terminated(input)?;
        for item in items {
            match item {
                TestOption::Timeout(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    options.timeout_secs = secs;
                }
                TestOption::Paused => options.paused = true,
            }
        }
        Ok(options)
    }
}

/// Run an async test on a current-thread runtime with a wall-clock limit.
///
/// With `paused` the runtime starts with the clock frozen so timers
/// auto-advance; only the wall-clock limit applies then, since virtual time
/// can legitimately run far ahead.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let TestOptions {
        timeout_secs,
        paused,
    } = parse_macro_input!(attr as TestOptions);

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

    let start_paused = if paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    let run = if paused {
        quote! { async move #block }
    } else {
        quote! {
            async {
                tokio::time::timeout(limit, async move #block)
                    .await
                    .expect("test timed out");
            }
        }
    };
    let watched = watchdog(
        timeout_secs,
        quote! {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                #start_paused
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(#run);
        },
    );

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            #watched
        }
    })
}

/// Run `body` on its own thread and fail the test if it has not finished
/// after `timeout_secs` of wall-clock time. Panics inside `body` are
/// re-raised on the test thread. `limit` is in scope for `body`.
fn watchdog(timeout_secs: u64, body: proc_macro2::TokenStream) -> proc_macro2::TokenStream {
    quote! {
        let limit = std::time::Duration::from_secs(#timeout_secs);
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = done_tx.send(outcome);
        });
        match done_rx.recv_timeout(limit) {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded {}s of wall-clock time", #timeout_secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
