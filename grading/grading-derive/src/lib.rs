use proc_macro::TokenStream;
use quote::quote_spanned;
use syn::{ItemFn, LitByteStr, parse_macro_input, spanned::Spanned};

#[proc_macro_attribute]
pub fn assert_output(attr: TokenStream, item: TokenStream) -> TokenStream {
    let output = parse_macro_input!(attr as LitByteStr);
    let mut input_fn = parse_macro_input!(item as ItemFn);
    let block = *input_fn.block;
    *input_fn.block = syn::parse_quote! {
        {
            let _return_val = (move || { #block })();
            let output = exokernel::with_current(|machine| machine.console_output());
            assert_eq!(Ok(output.as_str()), core::str::from_utf8(#output));
            _return_val
        }
    };
    TokenStream::from(quote_spanned! { input_fn.span() =>
        #input_fn
    })
}

#[proc_macro_attribute]
pub fn validate_alloc(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut input_fn = parse_macro_input!(item as ItemFn);
    let block = *input_fn.block;
    *input_fn.block = syn::parse_quote! {
        {
            exokernel::with_current(|machine| machine.track_alloc());
            let _return_val = (move || { #block })();
            exokernel::with_current(|machine| {
                machine.reap_all();
                machine.validate_alloc();
            });
            _return_val
        }
    };
    TokenStream::from(quote_spanned! { input_fn.span() =>
        #input_fn
    })
}
