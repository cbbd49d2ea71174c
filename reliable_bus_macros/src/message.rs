use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, Ident, LitStr};

pub fn derive_message(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => TokenStream::from(err.to_compile_error()),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let type_attrs = extract_type_attrs(input)?;
    let type_name = type_attrs.name.unwrap_or_else(|| name.to_string());

    let marked = extract_marked_fields(input)?;

    let topic_fn = type_attrs.topic.map(|topic| {
        quote! {
            fn topic(&self) -> ::core::option::Option<::std::string::String> {
                ::core::option::Option::Some(::std::string::String::from(#topic))
            }
        }
    });

    let key_items = marked.key.map(|field| {
        quote! {
            const HAS_PARTITION_KEY: bool = true;

            fn partition_key(&self) -> ::core::option::Option<::std::string::String> {
                ::core::option::Option::Some(::std::string::ToString::to_string(&self.#field))
            }
        }
    });

    let id_fn = marked.id.map(|field| {
        quote! {
            fn message_id(&self) -> ::core::option::Option<::std::string::String> {
                ::core::option::Option::Some(::std::string::ToString::to_string(&self.#field))
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::reliable_bus::Message for #name #ty_generics #where_clause {
            const TYPE_NAME: &'static str = #type_name;

            #topic_fn
            #key_items
            #id_fn
        }
    })
}

#[derive(Default)]
struct TypeAttrs {
    name: Option<String>,
    topic: Option<String>,
}

fn extract_type_attrs(input: &DeriveInput) -> syn::Result<TypeAttrs> {
    let mut attrs = TypeAttrs::default();
    for attr in &input.attrs {
        if !attr.path().is_ident("message") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.name = Some(value.value());
                Ok(())
            } else if meta.path.is_ident("topic") {
                let value: LitStr = meta.value()?.parse()?;
                attrs.topic = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("expected `name = \"...\"` or `topic = \"...\"`"))
            }
        })?;
    }
    Ok(attrs)
}

#[derive(Default)]
struct MarkedFields {
    key: Option<Ident>,
    id: Option<Ident>,
}

fn extract_marked_fields(input: &DeriveInput) -> syn::Result<MarkedFields> {
    let mut marked = MarkedFields::default();

    let fields = match &input.data {
        Data::Struct(data_struct) => match &data_struct.fields {
            Fields::Named(fields) => &fields.named,
            _ => return Ok(marked),
        },
        _ => return Ok(marked),
    };

    for field in fields {
        for attr in &field.attrs {
            if !attr.path().is_ident("message") {
                continue;
            }

            let mut is_key = false;
            let mut is_id = false;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("key") {
                    is_key = true;
                    Ok(())
                } else if meta.path.is_ident("id") {
                    is_id = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `key` or `id`"))
                }
            })?;

            let ident = field.ident.clone();
            if is_key {
                if marked.key.is_some() {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "only one field may be marked #[message(key)]",
                    ));
                }
                marked.key = ident.clone();
            }
            if is_id {
                if marked.id.is_some() {
                    return Err(syn::Error::new_spanned(
                        attr,
                        "only one field may be marked #[message(id)]",
                    ));
                }
                marked.id = ident;
            }
        }
    }

    Ok(marked)
}
