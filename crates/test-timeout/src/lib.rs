use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, ReturnType};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Default)]
struct TestArgs {
    secs: Option<u64>,
    worker_threads: Option<usize>,
}

/// Runs an async test on a fresh Tokio runtime and fails it once the deadline
/// elapses.
///
/// Accepted arguments: `secs = N` (deadline, default 30) and
/// `worker_threads = N` (switches to the multi-thread scheduler).
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut args = TestArgs::default();
    let args_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            let lit: LitInt = meta.value()?.parse()?;
            let secs: u64 = lit.base10_parse()?;
            if secs == 0 {
                return Err(meta.error("timeout must be greater than zero"));
            }
            args.secs = Some(secs);
            Ok(())
        } else if meta.path.is_ident("worker_threads") {
            let lit: LitInt = meta.value()?.parse()?;
            let threads: usize = lit.base10_parse()?;
            if threads == 0 {
                return Err(meta.error("worker_threads must be greater than zero"));
            }
            args.worker_threads = Some(threads);
            Ok(())
        } else {
            Err(meta.error("expected `secs` or `worker_threads`"))
        }
    });
    parse_macro_input!(attr with args_parser);

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
        .filter(|attr| !is_test_attribute(attr))
        .collect();

    let timeout = args.secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
    let builder = match args.worker_threads {
        Some(threads) => quote! {
            tokio::runtime::Builder::new_multi_thread().worker_threads(#threads)
        },
        None => quote! { tokio::runtime::Builder::new_current_thread() },
    };

    let output_ty = match &sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };
    sig.output = ReturnType::Default;

    // The body runs on its own thread so a test stuck outside an await point
    // (a blocked lock, a busy loop) still trips the deadline.
    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            trait TestOutcome {
                fn check(self);
            }
            impl TestOutcome for () {
                fn check(self) {}
            }
            impl<E: std::fmt::Debug> TestOutcome for Result<(), E> {
                fn check(self) {
                    if let Err(err) = self {
                        panic!("test returned an error: {err:?}");
                    }
                }
            }

            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = #builder
                        .enable_all()
                        .build()
                        .expect("failed to build Tokio runtime");
                    let body = async move #block;
                    let body: std::pin::Pin<Box<dyn std::future::Future<Output = #output_ty>>> =
                        Box::pin(body);
                    let output = runtime.block_on(async {
                        tokio::time::timeout(timeout_duration, body)
                            .await
                            .expect("test timed out")
                    });
                    TestOutcome::check(output);
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {:?}", timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

/// Matches `#[test]` and `#[tokio::test]` so they are not applied twice.
fn is_test_attribute(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
