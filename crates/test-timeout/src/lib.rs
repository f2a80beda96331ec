use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 45;

/// Wrap an async test in a fresh multi-thread runtime with a hard timeout.
/// `#[test_timeout::tokio_timeout_test]` defaults to 45 seconds;
/// `#[test_timeout::tokio_timeout_test(10)]` overrides the budget.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test requires an async function",
        )
        .to_compile_error()
        .into();
    }

    // A bare #[tokio::test] on the same function would double-wrap the body.
    let kept_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    TokenStream::from(quote! {
        #[test]
        #(#kept_attrs)*
        #vis #sig {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .expect("failed to build test runtime");
            // propagate the body's value so fallible tests keep their ? flow
            runtime.block_on(async {
                tokio::time::timeout(
                    std::time::Duration::from_secs(#timeout_secs),
                    async move #block,
                )
                .await
                .expect("test exceeded its timeout")
            })
        }
    })
}

fn parse_timeout(attr: TokenStream) -> Result<u64, syn::Error> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be nonzero"));
    }
    Ok(secs)
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
