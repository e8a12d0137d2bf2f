/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test attributes that fail a test which does not finish within a deadline.
//!
//! Both attributes run the test body on a dedicated thread and wait for it
//! from the test harness thread, so the deadline is enforced even if the body
//! blocks forever (for example on a lost cross-thread reply).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::Expr;
use syn::ItemFn;
use syn::Lit;
use syn::MetaNameValue;
use syn::Token;
use syn::parse_macro_input;
use syn::punctuated::Punctuated;

const DEFAULT_WORKER_THREADS: usize = 8;

struct TimedArgs {
    timeout_secs: u64,
    worker_threads: Option<usize>,
}

impl TimedArgs {
    fn parse(args: Punctuated<MetaNameValue, Token![,]>) -> syn::Result<Self> {
        let mut timeout_secs = None;
        let mut worker_threads = None;
        for arg in args {
            if arg.path.is_ident("timeout_secs") {
                timeout_secs = Some(int_literal::<u64>(&arg)?);
            } else if arg.path.is_ident("worker_threads") {
                worker_threads = Some(int_literal::<usize>(&arg)?);
            } else {
                return Err(syn::Error::new_spanned(
                    arg.path,
                    "expected `timeout_secs` or `worker_threads`",
                ));
            }
        }
        let timeout_secs = timeout_secs.ok_or_else(|| {
            syn::Error::new(
                proc_macro2::Span::call_site(),
                "missing required argument `timeout_secs`",
            )
        })?;
        Ok(Self {
            timeout_secs,
            worker_threads,
        })
    }
}

fn int_literal<N>(arg: &MetaNameValue) -> syn::Result<N>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    match &arg.value {
        Expr::Lit(lit) => match &lit.lit {
            Lit::Int(val) => val.base10_parse::<N>(),
            _ => Err(syn::Error::new_spanned(
                &arg.value,
                "please pass an integer literal",
            )),
        },
        _ => Err(syn::Error::new_spanned(
            &arg.value,
            "please pass an integer literal",
        )),
    }
}

/// Wrap `run` (an expression evaluating to the test's result) in a watchdog:
/// `run` executes on its own thread while the harness thread waits at most
/// `timeout_secs` for it.
fn watchdog(input_fn: &ItemFn, timeout_secs: u64, run: TokenStream2) -> TokenStream2 {
    let fn_attrs = &input_fn.attrs;
    let fn_vis = &input_fn.vis;
    let fn_name = &input_fn.sig.ident;
    let output = &input_fn.sig.output;

    quote! {
        #[test]
        #(#fn_attrs)*
        #fn_vis fn #fn_name() #output {
            // Fully qualified so nothing leaks into the test body's scope.
            let (result_tx, result_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(::std::stringify!(#fn_name).to_string())
                .spawn(move || {
                    let result = ::std::panic::catch_unwind(
                        ::std::panic::AssertUnwindSafe(|| #run),
                    );
                    let _ = result_tx.send(result);
                })
                .expect("failed to spawn test thread");

            let timeout = ::std::time::Duration::from_secs(#timeout_secs);
            match result_rx.recv_timeout(timeout) {
                Ok(Ok(test_result)) => test_result,
                Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    ::std::panic!("test timed out after {} seconds", #timeout_secs);
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    ::std::panic!("test thread exited without sending a result");
                }
            }
        }
    }
}

/// A synchronous test with a deadline.
///
/// ```ignore
/// #[timed_test(timeout_secs = 5)]
/// fn my_test() {
///     // Must complete within 5 seconds.
/// }
/// ```
#[proc_macro_attribute]
pub fn timed_test(attr: TokenStream, input: TokenStream) -> TokenStream {
    let args =
        parse_macro_input!(attr with Punctuated::<MetaNameValue, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    let args = match TimedArgs::parse(args) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if let Some(asyncness) = &input_fn.sig.asyncness {
        return syn::Error::new_spanned(asyncness, "use #[async_timed_test] for async tests")
            .to_compile_error()
            .into();
    }
    if args.worker_threads.is_some() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`worker_threads` only applies to #[async_timed_test]",
        )
        .to_compile_error()
        .into();
    }

    let fn_block = &input_fn.block;
    let run = quote! { (move || #fn_block)() };
    watchdog(&input_fn, args.timeout_secs, run).into()
}

/// An async test with a deadline, driven by its own multi-threaded tokio
/// runtime.
///
/// ```ignore
/// #[async_timed_test(timeout_secs = 5, worker_threads = 2)]
/// async fn my_test() {
///     tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
/// }
/// ```
#[proc_macro_attribute]
pub fn async_timed_test(attr: TokenStream, input: TokenStream) -> TokenStream {
    let args =
        parse_macro_input!(attr with Punctuated::<MetaNameValue, Token![,]>::parse_terminated);
    let input_fn = parse_macro_input!(input as ItemFn);

    let args = match TimedArgs::parse(args) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if input_fn.sig.asyncness.is_none() {
        return syn::Error::new_spanned(&input_fn.sig, "test function must be async")
            .to_compile_error()
            .into();
    }

    let worker_threads = args.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS);
    let fn_block = &input_fn.block;
    let run = quote! {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(#worker_threads)
            .enable_all()
            .build()
            .expect("failed to build test runtime")
            .block_on(async move #fn_block)
    };
    watchdog(&input_fn, args.timeout_secs, run).into()
}
