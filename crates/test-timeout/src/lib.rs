//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` replaces `#[tokio::test]`; `#[timeout]` wraps a
//! plain `#[test]`. Both run the body on a watchdog thread and panic once the
//! deadline passes. Arguments: a bare number of seconds, or `secs = N`, plus
//! `flavor = "multi_thread"` for the async variant.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, LitStr};

const DEFAULT_SECS: u64 = 30;

struct Options {
    secs: u64,
    multi_thread: bool,
}

fn parse_options(attr: TokenStream, allow_flavor: bool) -> syn::Result<Options> {
    let mut options = Options {
        secs: DEFAULT_SECS,
        multi_thread: false,
    };
    if attr.is_empty() {
        return Ok(options);
    }
    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        options.secs = positive(&lit)?;
        return Ok(options);
    }

    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("secs") {
            options.secs = positive(&meta.value()?.parse::<LitInt>()?)?;
            Ok(())
        } else if allow_flavor && meta.path.is_ident("flavor") {
            let flavor: LitStr = meta.value()?.parse()?;
            options.multi_thread = match flavor.value().as_str() {
                "multi_thread" => true,
                "current_thread" => false,
                _ => return Err(meta.error("flavor must be \"current_thread\" or \"multi_thread\"")),
            };
            Ok(())
        } else {
            Err(meta.error("unsupported timeout argument"))
        }
    });
    parser.parse(attr)?;
    Ok(options)
}

fn positive(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}

/// Runs `body` on its own thread and waits at most `secs` for it to finish.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __deadline = ::std::time::Duration::from_secs(#secs);
        let (__done, __outcome) = ::std::sync::mpsc::sync_channel(1);
        let __worker = ::std::thread::Builder::new()
            .name(::std::string::String::from("test-watchdog"))
            .spawn(move || {
                let __result = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
                let _ = __done.send(__result);
            })
            .expect("spawn test thread");
        match __outcome.recv_timeout(__deadline) {
            Ok(Ok(())) => {
                let _ = __worker.join();
            }
            Ok(Err(__panic)) => ::std::panic::resume_unwind(__panic),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s deadline", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(&sig.fn_token, "tokio_timeout_test needs an async fn")
            .to_compile_error()
            .into();
    }
    let attrs = attrs.into_iter().filter(|attr| !is_test_marker(attr));

    let runtime = if options.multi_thread {
        quote!(::tokio::runtime::Builder::new_multi_thread().worker_threads(2))
    } else {
        quote!(::tokio::runtime::Builder::new_current_thread())
    };
    let secs = options.secs;
    let body = watchdog(
        secs,
        quote! {
            let __runtime = #runtime.enable_all().build().expect("build test runtime");
            __runtime.block_on(async move {
                let __limit = ::std::time::Duration::from_secs(#secs);
                if ::tokio::time::timeout(__limit, async move #block).await.is_err() {
                    panic!("test exceeded its {}s deadline", #secs);
                }
            });
        },
    );

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.fn_token, "use tokio_timeout_test for async tests")
            .to_compile_error()
            .into();
    }
    let attrs = attrs.into_iter().filter(|attr| !is_test_marker(attr));
    let body = watchdog(options.secs, quote!(#block;));

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    }
    .into()
}
