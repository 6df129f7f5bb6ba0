use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Attribute macro for tests that installs the crate's tracing subscriber
/// before the body runs. Arguments are forwarded to `#[tokio::test]`, so
/// `#[vigil::test(start_paused = true)]` gives a paused-clock test.
///
/// #[vigil::test]
/// fn my_sync_test() { ... }
///
/// #[vigil::test(start_paused = true)]
/// async fn my_async_test() { ... }
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args_ts = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    let paren_args = if args_ts.is_empty() {
        quote! {}
    } else {
        quote! { ( #args_ts ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #[tokio::test #paren_args]
            #vis #sig {
                vigil::trace::init_for_tests();
                #block
            }
        }
    } else {
        quote! {
            #[test]
            #vis #sig {
                vigil::trace::init_for_tests();
                #block
            }
        }
    };
    output.into()
}
