//! Derive macro for the `HeapObject` trait.

use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Attribute, Data, DeriveInput, Field,
    Fields, GenericParam, Generics, Index, LitStr, Member, Path,
};

struct Options {
    krate: Path,
    name: Option<LitStr>,
}

fn parse_options(attrs: &[Attribute]) -> syn::Result<Options> {
    let mut options = Options {
        krate: parse_quote!(::objmem),
        name: None,
    };
    for attr in attrs {
        if !attr.path().is_ident("objmem") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                options.krate = meta.value()?.parse()?;
                Ok(())
            } else if meta.path.is_ident("name") {
                options.name = Some(meta.value()?.parse()?);
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        })?;
    }
    Ok(options)
}

fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in &field.attrs {
        if !attr.path().is_ident("objmem") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

fn has_repr_c(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|attr| {
        if !attr.path().is_ident("repr") {
            return false;
        }
        let mut found = false;
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("C") {
                found = true;
            }
            // Skip `align(N)` and friends.
            if meta.input.peek(syn::token::Paren) {
                let content;
                syn::parenthesized!(content in meta.input);
                let _: TokenStream = content.parse()?;
            }
            Ok(())
        });
        found
    })
}

#[proc_macro_derive(HeapObject, attributes(objmem))]
pub fn derive_heap_object(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.into_compile_error().into(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let options = parse_options(&input.attrs)?;
    let krate = &options.krate;

    let fields = match &input.data {
        Data::Struct(data) => &data.fields,
        Data::Enum(data) => {
            return Err(syn::Error::new(
                data.enum_token.span,
                "`HeapObject` can only be derived for structs",
            ))
        }
        Data::Union(data) => {
            return Err(syn::Error::new(
                data.union_token.span,
                "`HeapObject` can only be derived for structs",
            ))
        }
    };
    if !has_repr_c(&input.attrs) {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "`HeapObject` types must be `#[repr(C)]`",
        ));
    }

    let members: Vec<(Member, &Field)> = match fields {
        Fields::Named(f) => f
            .named
            .iter()
            .filter_map(|field| field.ident.clone().map(|ident| (Member::Named(ident), field)))
            .collect(),
        Fields::Unnamed(f) => f
            .unnamed
            .iter()
            .enumerate()
            .map(|(i, field)| (Member::Unnamed(Index::from(i)), field))
            .collect(),
        Fields::Unit => Vec::new(),
    };
    let Some((first, _)) = members.first() else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "`HeapObject` types must start with an `ObjectHeader` field",
        ));
    };

    let mut traced = Vec::new();
    for (member, field) in &members {
        if !is_skipped(field)? {
            traced.push((member, *field));
        }
    }

    let name = &input.ident;
    let name_str = options
        .name
        .clone()
        .unwrap_or_else(|| LitStr::new(&name.to_string(), name.span()));
    let generics = add_trait_bounds(krate, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let has_references = traced.iter().map(|(_, field)| {
        let ty = &field.ty;
        quote_spanned! {field.span() => || <#ty as #krate::Slots>::HAS_REFERENCES }
    });
    let live_calls = traced.iter().map(|(member, field)| {
        quote_spanned! {field.span() =>
            #krate::Slots::live_slots(&mut self.#member, marker);
        }
    });
    let live_general_calls = traced.iter().map(|(member, field)| {
        quote_spanned! {field.span() =>
            #krate::Slots::live_general_slots(&mut self.#member, handler);
        }
    });

    // The header check needs a concrete type.
    let header_check = if input.generics.params.is_empty() {
        quote! {
            const _: fn(&#name) -> &#krate::ObjectHeader = |object| &object.#first;
        }
    } else {
        quote! {}
    };

    Ok(quote! {
        #header_check

        unsafe impl #impl_generics #krate::HeapObject for #name #ty_generics #where_clause {
            const NAME: &'static str = #name_str;
            const HAS_REFERENCES: bool = false #(#has_references)*;

            #[inline]
            fn live(&mut self, marker: &mut #krate::Marker<'_>) {
                #(#live_calls)*
            }

            #[inline]
            fn live_general(&mut self, handler: &mut dyn #krate::MarkHandler) {
                #(#live_general_calls)*
            }
        }
    })
}

fn add_trait_bounds(krate: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_slots = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Slots")
                } else {
                    false
                }
            });
            if !has_slots {
                type_param.bounds.push(parse_quote!(#krate::Slots));
            }
            type_param.bounds.push(parse_quote!('static));
        }
    }
    generics
}
