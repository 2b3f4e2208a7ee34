use crate::utils::{is_valid_identifier, to_snake_case};
use proc_macro::TokenStream;
use proc_macro2::{Literal, Span};
use quote::quote;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{Item, LitStr, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[signal] 宏实现
/// - 支持结构体与枚举，原样保留类型定义
/// - 生成 `impl ::signalbus::signal::DescribeSignal`
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as SignalAttrConfig);
    let input = parse_macro_input!(item as Item);

    let (ident, generics) = match &input {
        Item::Struct(st) => (&st.ident, &st.generics),
        Item::Enum(en) => (&en.ident, &en.generics),
        other => {
            return syn::Error::new(other.span(), "#[signal] only supports struct or enum")
                .to_compile_error()
                .into();
        }
    };

    let name = cfg
        .name
        .unwrap_or_else(|| to_snake_case(&ident.to_string()));
    let burst_count = Literal::usize_unsuffixed(cfg.burst_count.unwrap_or(1));
    let autoflush = cfg.autoflush.unwrap_or(true);
    let order_by = match cfg.order_by {
        None => quote! { ::core::option::Option::None },
        Some(columns) => {
            let columns = columns.iter().map(|(column, desc)| {
                if *desc {
                    quote! { ::signalbus::signal::OrderColumn::desc(#column) }
                } else {
                    quote! { ::signalbus::signal::OrderColumn::asc(#column) }
                }
            });
            quote! {
                ::core::option::Option::Some(::signalbus::signal::OrderBy::new(
                    ::std::vec![#(#columns),*]
                ))
            }
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let expanded = quote! {
        #input

        impl #impl_generics ::signalbus::signal::DescribeSignal for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;

            fn describe() -> ::signalbus::signal::SignalDescriptor {
                ::signalbus::signal::SignalDescriptor::builder()
                    .name(#name)
                    .burst_count(#burst_count)
                    .autoflush(#autoflush)
                    .maybe_order_by(#order_by)
                    .build()
            }
        }
    };
    TokenStream::from(expanded)
}

// -------- parsing --------

struct SignalAttrConfig {
    name: Option<String>,
    burst_count: Option<usize>,
    autoflush: Option<bool>,
    /// (列名, 是否降序)
    order_by: Option<Vec<(String, bool)>>,
}

impl Parse for SignalAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut cfg = Self {
            name: None,
            burst_count: None,
            autoflush: None,
            order_by: None,
        };
        if input.is_empty() {
            return Ok(cfg);
        }

        let elems: Punctuated<SignalAttrElem, Token![,]> = Punctuated::parse_terminated(input)?;
        for elem in elems {
            match elem {
                SignalAttrElem::Name(span, v) => set_once(&mut cfg.name, v, span, "name")?,
                SignalAttrElem::BurstCount(span, v) => {
                    set_once(&mut cfg.burst_count, v, span, "burst_count")?
                }
                SignalAttrElem::Autoflush(span, v) => {
                    set_once(&mut cfg.autoflush, v, span, "autoflush")?
                }
                SignalAttrElem::OrderBy(span, v) => set_once(&mut cfg.order_by, v, span, "order_by")?,
            }
        }
        Ok(cfg)
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T, span: Span, key: &str) -> Result<()> {
    if slot.is_some() {
        return Err(syn::Error::new(
            span,
            format!("duplicate key '{key}' in attribute"),
        ));
    }
    *slot = Some(value);
    Ok(())
}

enum SignalAttrElem {
    Name(Span, String),
    BurstCount(Span, usize),
    Autoflush(Span, bool),
    OrderBy(Span, Vec<(String, bool)>),
}

impl Parse for SignalAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: syn::Ident = input.parse()?;
        let _eq: Token![=] = input.parse()?;
        let span = key.span();
        match key.to_string().as_str() {
            "name" => {
                let lit: LitStr = input.parse()?;
                let value = lit.value();
                if !is_valid_identifier(&value) {
                    return Err(syn::Error::new(lit.span(), "signal name must be an identifier"));
                }
                Ok(Self::Name(span, value))
            }
            "burst_count" => {
                let lit: syn::LitInt = input.parse()?;
                let value: usize = lit.base10_parse()?;
                if value == 0 {
                    return Err(syn::Error::new(lit.span(), "burst_count must be at least 1"));
                }
                Ok(Self::BurstCount(span, value))
            }
            "autoflush" => {
                let lit: syn::LitBool = input.parse()?;
                Ok(Self::Autoflush(span, lit.value()))
            }
            "order_by" => {
                let lit: LitStr = input.parse()?;
                let columns = parse_order_by(&lit.value())
                    .map_err(|reason| syn::Error::new(lit.span(), reason))?;
                Ok(Self::OrderBy(span, columns))
            }
            _ => Err(syn::Error::new(
                span,
                "unknown key in attribute; expected one of 'name', 'burst_count', 'autoflush', 'order_by'",
            )),
        }
    }
}

fn parse_order_by(text: &str) -> std::result::Result<Vec<(String, bool)>, String> {
    let mut columns = Vec::new();
    for part in text.split(',') {
        let words: Vec<&str> = part.split_whitespace().collect();
        let (column, desc) = match words.as_slice() {
            [column] => (*column, false),
            [column, dir] if dir.eq_ignore_ascii_case("asc") => (*column, false),
            [column, dir] if dir.eq_ignore_ascii_case("desc") => (*column, true),
            _ => return Err(format!("malformed order_by \"{text}\"")),
        };
        if !is_valid_identifier(column) {
            return Err(format!("invalid order_by column \"{column}\""));
        }
        columns.push((column.to_string(), desc));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_text_is_checked() {
        assert_eq!(
            parse_order_by("created_at DESC, id").unwrap(),
            vec![("created_at".to_string(), true), ("id".to_string(), false)]
        );
        assert!(parse_order_by("").is_err());
        assert!(parse_order_by("id sideways").is_err());
        assert!(parse_order_by("1st").is_err());
    }
}
