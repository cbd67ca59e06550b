use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    parse::ParseStream, parse_macro_input, FnArg, Ident, ItemFn, LitBool, LitStr, Pat, ReturnType,
    Token, Type,
};

// ============================================================================
// #[remote_fn] attribute macro
// ============================================================================

/// Attribute macro that turns a function into a registrable remote function.
///
/// The function is replaced by a unit struct of the same name implementing
/// `remote_fn::RemoteFunction`. The original body stays callable as the
/// associated function `call`.
///
/// # Usage
///
/// Bare, registered under the function's own name:
/// ```ignore
/// #[remote_fn]
/// fn add(a: i64, b: i64) -> i64 {
///     a + b
/// }
///
/// registry.register(add)?;          // {default namespace}.add
/// assert_eq!(add::call(2, 3), 5);
/// ```
///
/// With options:
/// ```ignore
/// #[remote_fn(namespace = "billing", name = "charge", durable)]
/// async fn charge_card(card: String, cents: u64) -> Result<Receipt, PaymentError> {
///     // ...
/// }
/// ```
///
/// The macro supports:
/// - `name = "..."`: register under this name instead of the function name
/// - `namespace = "..."`: fixed namespace instead of the registry default
/// - `durable` / `durable = bool`: consume through a durable pull consumer
///
/// Arguments bind positionally or by keyword; `Option<T>` arguments may be
/// omitted. The return value must be `Serialize`. A `Result` return has its
/// error converted with `Into<FunctionError>`. Async functions become async
/// handlers; everything else runs as a blocking handler.
#[proc_macro_attribute]
pub fn remote_fn(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with parse_remote_fn_args);
    let func = parse_macro_input!(item as ItemFn);

    match expand_remote_fn(args, func) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

#[derive(Default)]
struct RemoteFnArgs {
    name: Option<LitStr>,
    namespace: Option<LitStr>,
    durable: Option<LitBool>,
}

fn parse_remote_fn_args(input: ParseStream) -> syn::Result<RemoteFnArgs> {
    let mut args = RemoteFnArgs::default();

    // Keyword arguments: `name = "..."`, `namespace = "..."`, `durable [= bool]`
    while !input.is_empty() {
        let key: Ident = input.parse()?;
        if key == "name" {
            input.parse::<Token![=]>()?;
            args.name = Some(input.parse()?);
        } else if key == "namespace" {
            input.parse::<Token![=]>()?;
            args.namespace = Some(input.parse()?);
        } else if key == "durable" {
            if input.peek(Token![=]) {
                input.parse::<Token![=]>()?;
                args.durable = Some(input.parse()?);
            } else {
                args.durable = Some(LitBool::new(true, key.span()));
            }
        } else {
            return Err(syn::Error::new(
                key.span(),
                "expected `name`, `namespace` or `durable`",
            ));
        }

        if input.is_empty() {
            break;
        }
        input.parse::<Token![,]>()?;
    }

    Ok(args)
}

fn expand_remote_fn(args: RemoteFnArgs, func: ItemFn) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = func;

    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &sig.generics,
            "#[remote_fn] functions cannot be generic",
        ));
    }

    let ident = sig.ident.clone();
    let declared_name = match &args.name {
        Some(name) => name.value(),
        None => ident.to_string(),
    };

    // Parameter names and their binding statements
    let mut param_names = Vec::new();
    let mut param_idents = Vec::new();
    let mut bindings = Vec::new();
    for (position, arg) in sig.inputs.iter().enumerate() {
        let pat_type = match arg {
            FnArg::Typed(pat_type) => pat_type,
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "#[remote_fn] functions cannot take `self`",
                ))
            }
        };
        let param = match &*pat_type.pat {
            Pat::Ident(pat_ident) => pat_ident.ident.clone(),
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "#[remote_fn] arguments must be plain identifiers",
                ))
            }
        };
        let ty = &pat_type.ty;
        let name = param.to_string();
        let name = name.trim_start_matches("r#").to_string();

        bindings.push(if is_option(ty) {
            quote! { let #param: #ty = __request.bind_optional(#position, #name)?; }
        } else {
            quote! { let #param: #ty = __request.bind(#position, #name)?; }
        });
        param_names.push(name);
        param_idents.push(param);
    }

    let is_async = sig.asyncness.is_some();
    let await_call = if is_async {
        quote! { .await }
    } else {
        quote! {}
    };
    let invoke = if returns_result(&sig.output) {
        quote! {
            let __value = #ident::call(#(#param_idents),*) #await_call
                .map_err(::core::convert::Into::<::remote_fn::FunctionError>::into)?;
            ::remote_fn::__private::into_result(__value)
        }
    } else {
        quote! {
            ::remote_fn::__private::into_result(#ident::call(#(#param_idents),*) #await_call)
        }
    };

    let body = quote! {
        __request.check_arity(&[#(#param_names),*])?;
        #(#bindings)*
        #invoke
    };
    let handler = if is_async {
        quote! {
            ::remote_fn::Handler::from_async(|__request: ::remote_fn::CallRequest| async move {
                #body
            })
        }
    } else {
        quote! {
            ::remote_fn::Handler::blocking(
                |__request: ::remote_fn::CallRequest| -> ::remote_fn::HandlerResult { #body },
            )
        }
    };

    let namespace = args
        .namespace
        .as_ref()
        .map(|ns| quote! { .namespace(#ns) });
    let durable = args
        .durable
        .as_ref()
        .map(|durable| quote! { .durable(#durable) });

    let mut call_sig = sig.clone();
    call_sig.ident = format_ident!("call");

    Ok(quote! {
        #[allow(non_camel_case_types)]
        #[derive(Clone, Copy, Debug, Default)]
        #vis struct #ident;

        impl #ident {
            #(#attrs)*
            #vis #call_sig #block
        }

        impl ::remote_fn::RemoteFunction for #ident {
            const NAME: &'static str = #declared_name;

            fn registration(&self) -> ::remote_fn::Registration {
                ::remote_fn::Registration::new() #namespace #durable
            }

            fn into_handler(self) -> ::remote_fn::Handler {
                #handler
            }
        }
    })
}

/// Last path segment of `ty` is `name`.
fn last_segment_is(ty: &Type, name: &str) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident == name)
            .unwrap_or(false),
        Type::Group(group) => last_segment_is(&group.elem, name),
        Type::Paren(paren) => last_segment_is(&paren.elem, name),
        _ => false,
    }
}

fn is_option(ty: &Type) -> bool {
    last_segment_is(ty, "Option")
}

fn returns_result(output: &ReturnType) -> bool {
    match output {
        ReturnType::Default => false,
        ReturnType::Type(_, ty) => last_segment_is(ty, "Result"),
    }
}
